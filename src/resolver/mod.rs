//! Turns a logical rate limit check into bucket operations and a single [Decision].

mod decision;

pub use decision::{
    DenialBody, Decision, RATELIMIT_LIMIT, RATELIMIT_REMAINING, RATELIMIT_RESET,
};

use crate::backend::memory::InMemoryBackend;
use crate::backend::{
    BackendError, BucketBackend, BucketInput, BucketOutcome, BucketParams, StoreConnector,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, RateLimitConfig};
use crate::policy::audience::AudienceClassifier;
use crate::policy::identity::Identity;
use crate::policy::{Audience, Kind, PolicyError, PolicyTable};
use actix_web::{HttpResponse, ResponseError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Key component of the per-IP gate, shared by every kind and audience.
pub const GLOBAL_IP_SCOPE: &str = "_global_ip";

/// What the resolver does after the shared store has failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FallbackMode {
    /// Use the in-memory engine for the rest of the resolver's lifetime. No request after the
    /// first failure pays for another connection attempt, but the resolver never recovers.
    Pinned,
    /// Try the shared store again once this long has passed since the last failure.
    Reprobe(Duration),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// A store answered with data that cannot be trusted. Never absorbed by falling back.
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl ResponseError for ResolveError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::InternalServerError().finish()
    }
}

/// Resolves policies, derives bucket keys, and consumes from the per-identity and per-IP buckets.
///
/// The shared store connection is acquired lazily on first use. Connectivity failures switch the
/// resolver to an in-process [InMemoryBackend], according to its [FallbackMode].
pub struct RateLimitResolver {
    enabled: bool,
    namespace: String,
    subject_salt: String,
    policies: PolicyTable,
    secondary: BucketParams,
    classifier: AudienceClassifier,
    clock: Arc<dyn Clock>,
    fallback_mode: FallbackMode,
    store_timeout: Option<Duration>,
    connector: Option<Arc<dyn StoreConnector>>,
    shared: OnceCell<Arc<dyn BucketBackend>>,
    fallback: InMemoryBackend,
    // Epoch ms of the last shared store failure, None while the shared store is in use
    degraded_since: Mutex<Option<u64>>,
}

impl RateLimitResolver {
    pub fn builder() -> RateLimitResolverBuilder {
        RateLimitResolverBuilder {
            config: RateLimitConfig::default(),
            connector: None,
            clock: Arc::new(SystemClock),
            fallback_mode: None,
            store_timeout: None,
            fallback_gc_interval: Some(Duration::from_secs(
                crate::backend::memory::DEFAULT_GC_INTERVAL_SECONDS,
            )),
        }
    }

    /// Consume `tokens` from the buckets of `identity` for `kind`, as seen by `audience`.
    pub async fn enforce(
        &self,
        kind: Kind,
        audience: Audience,
        identity: &Identity,
        tokens: u64,
    ) -> Result<Decision, ResolveError> {
        let now = self.clock.now_ms();
        if !self.enabled {
            return Ok(Decision::unlimited(kind, audience, now));
        }
        let params = self.policies.get(kind, audience);
        let primary = BucketInput::new(
            self.primary_key(kind, audience, identity),
            params,
            tokens,
            now,
        );
        let secondary = BucketInput::new(self.secondary_key(identity), self.secondary, tokens, now);

        // Independent keys, so both gates are attempted and the order does not matter
        let (primary, secondary) =
            futures::future::try_join(self.consume(primary), self.consume(secondary)).await?;
        let decision = Decision::merge(kind, audience, params.capacity, &primary, &secondary, now);
        if !decision.allowed {
            log::debug!(
                "Rate limited {kind} for {audience} audience, retry after {}s",
                decision.retry_after_seconds
            );
        }
        Ok(decision)
    }

    /// Like [RateLimitResolver::enforce], with the kind and audience given by name.
    ///
    /// Unknown names are an error: there is no safe default policy.
    pub async fn enforce_named(
        &self,
        kind: &str,
        audience: &str,
        identity: &Identity,
        tokens: u64,
    ) -> Result<Decision, ResolveError> {
        let kind: Kind = kind.parse()?;
        let audience: Audience = audience.parse()?;
        self.enforce(kind, audience, identity, tokens).await
    }

    /// Reports the current state of the buckets without taking any tokens.
    pub async fn peek(
        &self,
        kind: Kind,
        audience: Audience,
        identity: &Identity,
    ) -> Result<Decision, ResolveError> {
        self.enforce(kind, audience, identity, 0).await
    }

    /// Drops the per-identity bucket so the next request starts with a full bucket.
    pub async fn reset(
        &self,
        kind: Kind,
        audience: Audience,
        identity: &Identity,
    ) -> Result<(), ResolveError> {
        let key = self.primary_key(kind, audience, identity);
        if let Some(shared) = self.shared_engine().await {
            match shared.remove_key(&key).await {
                Ok(()) => {}
                Err(e) if e.is_unavailable() => self.mark_degraded(&e),
                Err(e) => return Err(e.into()),
            }
        }
        self.fallback.remove_key(&key).await?;
        Ok(())
    }

    /// Audience for a free-text affiliation label, see [AudienceClassifier].
    pub fn classify_audience(&self, label: Option<&str>) -> Audience {
        self.classifier.classify_opt(label)
    }

    pub fn classifier(&self) -> &AudienceClassifier {
        &self.classifier
    }

    /// Whether requests are currently served by the in-memory engine because the shared store
    /// failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded_since().is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn primary_key(&self, kind: Kind, audience: Audience, identity: &Identity) -> String {
        format!(
            "{}:{kind}:{audience}:{}",
            self.namespace,
            identity.subject(&self.subject_salt)
        )
    }

    fn secondary_key(&self, identity: &Identity) -> String {
        format!(
            "{}:{GLOBAL_IP_SCOPE}:{}",
            self.namespace,
            identity.ip_subject(&self.subject_salt)
        )
    }

    async fn consume(&self, input: BucketInput) -> Result<BucketOutcome, ResolveError> {
        if let Some(shared) = self.shared_engine().await {
            match self.consume_shared(shared.as_ref(), input.clone()).await {
                Ok(outcome) => {
                    self.mark_healthy();
                    return Ok(outcome);
                }
                Err(e) if e.is_unavailable() => self.mark_degraded(&e),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.fallback.consume(input).await?)
    }

    async fn consume_shared(
        &self,
        shared: &dyn BucketBackend,
        input: BucketInput,
    ) -> Result<BucketOutcome, BackendError> {
        match self.store_timeout {
            None => shared.consume(input).await,
            Some(timeout) => actix_web::rt::time::timeout(timeout, shared.consume(input))
                .await
                .map_err(|elapsed| BackendError::Unavailable(Box::new(elapsed)))?,
        }
    }

    /// The shared engine, if configured and not ruled out by an earlier failure.
    async fn shared_engine(&self) -> Option<Arc<dyn BucketBackend>> {
        let connector = self.connector.as_ref()?;
        if let Some(since) = self.degraded_since() {
            match self.fallback_mode {
                FallbackMode::Pinned => return None,
                FallbackMode::Reprobe(after) => {
                    let elapsed = self.clock.now_ms().saturating_sub(since);
                    if u128::from(elapsed) < after.as_millis() {
                        return None;
                    }
                }
            }
        }
        match self.shared.get_or_try_init(|| connector.connect()).await {
            Ok(engine) => Some(engine.clone()),
            Err(e) => {
                self.mark_degraded(&e);
                None
            }
        }
    }

    fn degraded_since(&self) -> Option<u64> {
        *self
            .degraded_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_degraded(&self, error: &BackendError) {
        let mut degraded = self
            .degraded_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if degraded.is_none() {
            log::warn!("Shared rate limit store failed, using the in-memory engine: {error}");
        }
        *degraded = Some(self.clock.now_ms());
    }

    fn mark_healthy(&self) {
        // A call that was already in flight when the store failed must not undo the pin
        if self.fallback_mode == FallbackMode::Pinned {
            return;
        }
        let mut degraded = self
            .degraded_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if degraded.take().is_some() {
            log::info!("Shared rate limit store reachable again");
        }
    }
}

pub struct RateLimitResolverBuilder {
    config: RateLimitConfig,
    connector: Option<Arc<dyn StoreConnector>>,
    clock: Arc<dyn Clock>,
    fallback_mode: Option<FallbackMode>,
    store_timeout: Option<Duration>,
    fallback_gc_interval: Option<Duration>,
}

impl RateLimitResolverBuilder {
    pub fn config(mut self, config: RateLimitConfig) -> Self {
        self.config = config;
        self
    }

    /// The shared store. Without one, every request uses the in-memory engine.
    pub fn shared_store(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides the mode derived from [RateLimitConfig::fallback].
    pub fn fallback_mode(mut self, mode: FallbackMode) -> Self {
        self.fallback_mode = Some(mode);
        self
    }

    /// Treat a shared store call that takes longer than `timeout` as a connectivity failure.
    pub fn store_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// See [InMemoryBackendBuilder::with_gc_interval](crate::backend::memory::InMemoryBackendBuilder::with_gc_interval).
    pub fn fallback_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.fallback_gc_interval = interval;
        self
    }

    /// Validates the configuration and builds the resolver.
    ///
    /// Must be called from within an actix runtime when fallback garbage collection is enabled.
    pub fn build(self) -> Result<RateLimitResolver, ConfigError> {
        let config = self.config;
        let policies = config.policy_table()?;
        let secondary = config.secondary_params()?;
        let fallback = InMemoryBackend::builder()
            .with_gc_interval(self.fallback_gc_interval)
            .with_clock(self.clock.clone())
            .build();
        Ok(RateLimitResolver {
            enabled: config.enabled,
            namespace: config.namespace,
            subject_salt: config.subject_salt,
            policies,
            secondary,
            classifier: AudienceClassifier::with_overrides(&config.audience_markers),
            clock: self.clock,
            fallback_mode: self
                .fallback_mode
                .unwrap_or_else(|| config.fallback.mode()),
            store_timeout: self.store_timeout,
            connector: self.connector,
            shared: OnceCell::new(),
            fallback,
            degraded_since: Mutex::new(None),
        })
    }
}
