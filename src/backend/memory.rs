use crate::backend::token_bucket::{self, BucketState};
use crate::backend::{BackendError, BucketBackend, BucketInput, BucketOutcome};
use crate::clock::{Clock, SystemClock};
use actix_web::rt::task::JoinHandle;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

/// A token bucket [BucketBackend] that uses [Dashmap](dashmap::DashMap) to store buckets in
/// process memory.
///
/// Consumes on the same key are serialized by the map's shard lock. There is no coordination
/// with other processes: N processes using this backend give each caller N independent buckets.
#[derive(Clone)]
pub struct InMemoryBackend {
    map: Arc<DashMap<String, Value>>,
    _gc: Option<Arc<GcHandle>>,
}

struct Value {
    state: BucketState,
    expires_at_ms: u64,
}

struct GcHandle(JoinHandle<()>);

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl InMemoryBackend {
    pub fn builder() -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
            clock: Arc::new(SystemClock),
        }
    }

    fn garbage_collector(
        map: Arc<DashMap<String, Value>>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let now = clock.now_ms();
                map.retain(|_k, v| v.expires_at_ms > now);
                actix_web::rt::time::sleep(interval).await;
            }
        })
    }

    /// Number of buckets currently held, including expired ones not yet collected.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[async_trait]
impl BucketBackend for InMemoryBackend {
    async fn consume(&self, input: BucketInput) -> Result<BucketOutcome, BackendError> {
        input.params.validate()?;
        let now = input.now_ms;
        let expires_at_ms = now.saturating_add(input.ttl.as_millis() as u64);
        let outcome = match self.map.entry(input.key) {
            Entry::Occupied(mut entry) => {
                let value = entry.get_mut();
                // An expired bucket behaves as if the store had already dropped it
                let stored = (value.expires_at_ms > now).then_some(value.state);
                let (state, outcome) =
                    token_bucket::consume(stored, &input.params, input.tokens, now);
                value.state = state;
                value.expires_at_ms = expires_at_ms;
                outcome
            }
            Entry::Vacant(entry) => {
                let (state, outcome) =
                    token_bucket::consume(None, &input.params, input.tokens, now);
                entry.insert(Value {
                    state,
                    expires_at_ms,
                });
                outcome
            }
        };
        Ok(outcome)
    }

    async fn remove_key(&self, key: &str) -> Result<(), BackendError> {
        self.map.remove(key);
        Ok(())
    }
}

pub struct InMemoryBackendBuilder {
    gc_interval: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBackendBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing expired buckets.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// The clock the garbage collector compares bucket expiry against.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the backend, spawning the garbage collector onto the current actix runtime if
    /// enabled.
    pub fn build(self) -> InMemoryBackend {
        let map = Arc::new(DashMap::<String, Value>::new());
        let gc = self.gc_interval.map(|gc_interval| {
            Arc::new(GcHandle(InMemoryBackend::garbage_collector(
                map.clone(),
                self.clock,
                gc_interval,
            )))
        });
        InMemoryBackend { map, _gc: gc }
    }
}
