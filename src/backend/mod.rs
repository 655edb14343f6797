pub mod memory;
pub mod token_bucket;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Minimum idle lifetime of a stored bucket.
pub const MIN_BUCKET_TTL_SECONDS: u64 = 60;

/// Refill schedule of a bucket.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BucketParams {
    /// Maximum number of tokens the bucket can hold.
    pub capacity: u64,
    /// Tokens credited per elapsed refill interval.
    pub refill_amount: u64,
    pub refill_interval_ms: u64,
}

impl BucketParams {
    /// Idle time after which an untouched bucket may be dropped by the store.
    ///
    /// Twice the refill interval (rounded up to whole seconds), and never below a minute.
    pub fn default_ttl(&self) -> Duration {
        let interval_secs = (self.refill_interval_ms + 999) / 1000;
        Duration::from_secs(MIN_BUCKET_TTL_SECONDS.max(2 * interval_secs))
    }

    fn validate(&self) -> Result<(), BackendError> {
        if self.refill_interval_ms == 0 {
            return Err(BackendError::InvalidInput("refill interval must be non-zero"));
        }
        if self.refill_amount == 0 {
            return Err(BackendError::InvalidInput("refill amount must be non-zero"));
        }
        Ok(())
    }
}

/// A single consume request against one bucket.
#[derive(Debug, Clone)]
pub struct BucketInput {
    /// Fully qualified bucket key.
    pub key: String,
    pub params: BucketParams,
    /// Tokens to take, zero to only observe the bucket.
    pub tokens: u64,
    /// Current time in epoch milliseconds.
    pub now_ms: u64,
    /// Idle expiry to set on the bucket.
    pub ttl: Duration,
}

impl BucketInput {
    pub fn new(key: String, params: BucketParams, tokens: u64, now_ms: u64) -> Self {
        Self {
            key,
            ttl: params.default_ttl(),
            params,
            tokens,
            now_ms,
        }
    }
}

/// Result of consuming from one bucket.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// Tokens left in the bucket after this call.
    pub remaining: u64,
    /// Epoch milliseconds at which the bucket will be full again.
    pub reset_at_ms: u64,
    /// Milliseconds until the request could succeed, zero when allowed.
    pub retry_after_ms: u64,
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// The store could not be reached. Callers may fall back to another engine.
    #[error("Rate limit store unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The store answered with something that is not a bucket outcome.
    #[error("Malformed response from the rate limit store: {0}")]
    MalformedResponse(String),
    /// The store was reached but refused to run the bucket operation.
    #[error("Rate limit store rejected the request: {0}")]
    Rejected(String),
    #[error("Invalid bucket parameters: {0}")]
    InvalidInput(&'static str),
}

impl BackendError {
    /// Whether this error is a connectivity failure, as opposed to a data integrity failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A store implementing the atomic token bucket operation.
///
/// Implementations must apply the refill and the consume of [token_bucket::consume] as one step
/// per key, with no other consume on the same key interleaved.
#[async_trait]
pub trait BucketBackend: Send + Sync {
    async fn consume(&self, input: BucketInput) -> Result<BucketOutcome, BackendError>;

    /// Removes the bucket for a given key, so that the next consume starts with a full bucket.
    async fn remove_key(&self, key: &str) -> Result<(), BackendError>;
}

/// Lazily produces a handle to the shared store.
///
/// Called the first time the store is needed, and again only when the resolver decides to
/// re-probe a store that previously failed.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BucketBackend>, BackendError>;
}
