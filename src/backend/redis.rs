use crate::backend::token_bucket::LUA_SCRIPT;
use crate::backend::{BackendError, BucketBackend, BucketInput, BucketOutcome, StoreConnector};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, Script, Value};
use std::borrow::Cow;
use std::sync::Arc;

static TOKEN_BUCKET_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(LUA_SCRIPT));

/// A token bucket [BucketBackend] that evaluates each consume as a Lua script inside Redis.
///
/// The script is addressed by its SHA1 digest (`EVALSHA`). If Redis has lost its script cache,
/// e.g. after a restart, the script is loaded again and the call retried once.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl RedisBackend {
    /// Create a RedisBackendBuilder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use actix_tiered_rate_limit::backend::redis::RedisBackend;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let backend = RedisBackend::builder(manager).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            connection,
            key_prefix: None,
        }
    }

    fn make_key<'t>(&self, key: &'t str) -> Cow<'t, str> {
        match &self.key_prefix {
            None => Cow::Borrowed(key),
            Some(prefix) => Cow::Owned(format!("{prefix}{key}")),
        }
    }

    async fn eval(&self, key: &str, input: &BucketInput) -> Result<Value, RedisError> {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(TOKEN_BUCKET_SCRIPT.get_hash())
            .arg(1)
            .arg(key)
            .arg(input.params.capacity)
            .arg(input.params.refill_amount)
            .arg(input.params.refill_interval_ms)
            .arg(input.tokens)
            .arg(input.now_ms)
            .arg(input.ttl.as_secs().max(1));
        let mut con = self.connection.clone();
        cmd.query_async(&mut con).await
    }

    async fn load_script(&self) -> Result<(), RedisError> {
        let mut con = self.connection.clone();
        let hash: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(LUA_SCRIPT)
            .query_async(&mut con)
            .await?;
        log::debug!("Loaded token bucket script {hash}");
        Ok(())
    }
}

pub struct Builder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl Builder {
    /// Apply an optional prefix to all rate limit keys given to this backend.
    ///
    /// This may be useful when the Redis instance is being used for other purposes; the prefix is
    /// used as a 'namespace' to avoid collision with other caches or keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    pub fn build(self) -> RedisBackend {
        RedisBackend {
            connection: self.connection,
            key_prefix: self.key_prefix,
        }
    }
}

#[async_trait]
impl BucketBackend for RedisBackend {
    async fn consume(&self, input: BucketInput) -> Result<BucketOutcome, BackendError> {
        input.params.validate()?;
        let key = self.make_key(&input.key);
        let reply = match self.eval(&key, &input).await {
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                log::warn!("Token bucket script missing from Redis, reloading");
                self.load_script().await.map_err(classify)?;
                self.eval(&key, &input).await.map_err(classify)?
            }
            other => other.map_err(classify)?,
        };
        parse_outcome(&reply)
    }

    /// Note that the key prefix (if set) is automatically included, you do not need to prepend
    /// it yourself.
    async fn remove_key(&self, key: &str) -> Result<(), BackendError> {
        let key = self.make_key(key);
        let mut con = self.connection.clone();
        let () = con.del(key.as_ref()).await.map_err(classify)?;
        Ok(())
    }
}

/// Connects lazily to Redis, producing a [RedisBackend].
pub struct RedisConnector {
    client: redis::Client,
    key_prefix: Option<String>,
}

impl RedisConnector {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            key_prefix: None,
        }
    }

    /// See [Builder::key_prefix].
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn BucketBackend>, BackendError> {
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| BackendError::Unavailable(Box::new(e)))?;
        let backend = RedisBackend::builder(manager)
            .key_prefix(self.key_prefix.as_deref())
            .build();
        Ok(Arc::new(backend))
    }
}

// Connectivity problems and a script cache that is still empty after a reload are recoverable by
// switching engines; anything else means the store ran our script and disagreed with it.
fn classify(e: RedisError) -> BackendError {
    let unavailable = e.is_io_error()
        || e.is_connection_refusal()
        || e.is_timeout()
        || e.is_connection_dropped()
        || matches!(
            e.kind(),
            ErrorKind::NoScriptError
                | ErrorKind::BusyLoadingError
                | ErrorKind::TryAgain
                | ErrorKind::ClusterDown
                | ErrorKind::MasterDown
        );
    if unavailable {
        BackendError::Unavailable(Box::new(e))
    } else {
        BackendError::Rejected(e.to_string())
    }
}

fn parse_outcome(reply: &Value) -> Result<BucketOutcome, BackendError> {
    let malformed = || BackendError::MalformedResponse(format!("{reply:?}"));
    let items = match reply {
        Value::Bulk(items) if items.len() == 4 => items,
        _ => return Err(malformed()),
    };
    let mut fields = [0u64; 4];
    for (field, item) in fields.iter_mut().zip(items) {
        *field = match item {
            Value::Int(n) if *n >= 0 => *n as u64,
            _ => return Err(malformed()),
        };
    }
    let [allowed, remaining, reset_at_ms, retry_after_ms] = fields;
    if allowed > 1 {
        return Err(malformed());
    }
    Ok(BucketOutcome {
        allowed: allowed == 1,
        remaining,
        reset_at_ms,
        retry_after_ms,
    })
}
