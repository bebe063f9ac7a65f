//! Where buckets live.
//!
//! An admission store performs refill, take and persist as one atomic step;
//! callers never read a bucket and write it back separately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::bucket::{self, BucketState, BucketStep};
use super::profile::RateLimitProfile;
use crate::queue::types::after;

/// Admission store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionStoreError {
    #[error("admission store unavailable: {0}")]
    Unavailable(String),
    #[error("admission store error: {0}")]
    Backend(String),
}

/// Atomic token-bucket storage.
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// Refill the bucket for `key`, take one token if possible, persist the
    /// result with an expiry of `profile.window`, all as one atomic step.
    async fn take(
        &self,
        key: &str,
        profile: &RateLimitProfile,
        now: DateTime<Utc>,
    ) -> Result<BucketStep, AdmissionStoreError>;
}

#[async_trait]
impl<S> AdmissionStore for Arc<S>
where
    S: AdmissionStore + ?Sized,
{
    async fn take(
        &self,
        key: &str,
        profile: &RateLimitProfile,
        now: DateTime<Utc>,
    ) -> Result<BucketStep, AdmissionStoreError> {
        (**self).take(key, profile, now).await
    }
}

/// Purge expired buckets once the map grows past this many entries.
const PURGE_THRESHOLD: usize = 10_000;

/// In-process admission store for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryAdmissionStore {
    buckets: Mutex<HashMap<String, StoredBucket>>,
}

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at: DateTime<Utc>,
}

impl InMemoryAdmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of live (unexpired) buckets at `now`.
    pub fn live_buckets(&self, now: DateTime<Utc>) -> usize {
        let buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        buckets.values().filter(|s| s.expires_at > now).count()
    }
}

#[async_trait]
impl AdmissionStore for InMemoryAdmissionStore {
    async fn take(
        &self,
        key: &str,
        profile: &RateLimitProfile,
        now: DateTime<Utc>,
    ) -> Result<BucketStep, AdmissionStoreError> {
        // Bucket updates are single assignments, so a poisoned map is still consistent.
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());

        if buckets.len() > PURGE_THRESHOLD {
            buckets.retain(|_, b| b.expires_at > now);
        }

        let prev = buckets
            .get(key)
            .filter(|b| b.expires_at > now)
            .map(|b| b.state);
        let step = bucket::take(prev, profile, now);
        buckets.insert(
            key.to_string(),
            StoredBucket {
                state: step.state,
                expires_at: after(now, profile.window),
            },
        );
        Ok(step)
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisAdmissionStore;

#[cfg(feature = "redis")]
mod redis_store {
    use super::*;
    use std::time::Duration;

    use redis::aio::ConnectionManager;
    use tokio::sync::OnceCell;
    use tracing::info;

    /// Refill, take, persist and expire in one server-side step.
    ///
    /// KEYS[1] bucket key; ARGV burst, refill per second, now (ms), window (ms).
    /// Returns `{allowed, tokens}` with tokens as a string to keep the fraction.
    const TAKE_SCRIPT: &str = r#"
local burst = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local window_ms = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = burst
  ts = now_ms
end

local elapsed = math.max(0, now_ms - ts) / 1000
tokens = math.min(burst, tokens + elapsed * rate)

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', now_ms)
redis.call('PEXPIRE', KEYS[1], window_ms)
return {allowed, tostring(tokens)}
"#;

    /// Redis-backed admission store shared by every process.
    ///
    /// The connection is opened on first use and every call carries a
    /// deadline, so an unreachable or silent Redis surfaces as
    /// [`AdmissionStoreError::Unavailable`] instead of blocking the caller.
    #[derive(Clone)]
    pub struct RedisAdmissionStore {
        client: redis::Client,
        conn: Arc<OnceCell<ConnectionManager>>,
        script: Arc<redis::Script>,
        prefix: String,
        timeout: Duration,
    }

    impl RedisAdmissionStore {
        /// Default deadline for one round trip, connection setup included.
        pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

        /// Parse `redis_url` without connecting.
        pub fn open(redis_url: impl AsRef<str>) -> Result<Self, AdmissionStoreError> {
            let client = redis::Client::open(redis_url.as_ref())
                .map_err(|e| AdmissionStoreError::Backend(e.to_string()))?;
            Ok(Self {
                client,
                conn: Arc::new(OnceCell::new()),
                script: Arc::new(redis::Script::new(TAKE_SCRIPT)),
                prefix: "backlot:rl:".to_string(),
                timeout: Self::DEFAULT_TIMEOUT,
            })
        }

        pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
            self.prefix = prefix.into();
            self
        }

        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }

        async fn connection(&self) -> Result<ConnectionManager, AdmissionStoreError> {
            let conn = self
                .conn
                .get_or_try_init(|| async {
                    let conn = ConnectionManager::new(self.client.clone())
                        .await
                        .map_err(map_redis_error)?;
                    info!("connected to redis admission store");
                    Ok::<_, AdmissionStoreError>(conn)
                })
                .await?;
            Ok(conn.clone())
        }

        async fn run_script(
            &self,
            key: &str,
            profile: &RateLimitProfile,
            now: DateTime<Utc>,
        ) -> Result<(i64, String), AdmissionStoreError> {
            let mut conn = self.connection().await?;
            let window_ms = u64::try_from(profile.window.as_millis()).unwrap_or(u64::MAX);

            self.script
                .key(format!("{}{}", self.prefix, key))
                .arg(profile.burst)
                .arg(profile.refill_rate)
                .arg(now.timestamp_millis())
                .arg(window_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_error)
        }
    }

    #[async_trait]
    impl AdmissionStore for RedisAdmissionStore {
        async fn take(
            &self,
            key: &str,
            profile: &RateLimitProfile,
            now: DateTime<Utc>,
        ) -> Result<BucketStep, AdmissionStoreError> {
            let (allowed, tokens) =
                tokio::time::timeout(self.timeout, self.run_script(key, profile, now))
                    .await
                    .map_err(|_| elapsed(self.timeout))??;

            let tokens: f64 = tokens
                .parse()
                .map_err(|_| AdmissionStoreError::Backend(format!("bad token count: {tokens}")))?;

            Ok(BucketStep {
                allowed: allowed == 1,
                state: BucketState {
                    tokens,
                    last_refill_at: now,
                },
            })
        }
    }

    fn elapsed(timeout: Duration) -> AdmissionStoreError {
        AdmissionStoreError::Unavailable(format!("no reply from redis within {timeout:?}"))
    }

    fn map_redis_error(err: redis::RedisError) -> AdmissionStoreError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            AdmissionStoreError::Unavailable(err.to_string())
        } else {
            AdmissionStoreError::Backend(err.to_string())
        }
    }
}
