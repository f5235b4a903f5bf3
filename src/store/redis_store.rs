//! Redis-backed quota store.
//!
//! Layout per scope key (all keys carry the configured prefix):
//! - sliding window: a sorted set of `member -> epoch-ms score`
//! - token bucket: a hash with `tokens` and `last_refill_ms` fields
//!
//! Every call shares one multiplexed [`ConnectionManager`], which
//! reconnects on its own after an outage. Both atomic decisions run as Lua
//! scripts, so each costs a single round trip.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use tracing::info;

use super::{
    BucketState, BucketTake, BucketUpdate, QuotaStore, StoreError, StoreResult, WindowAdmission,
    WindowOutcome,
};
use crate::clock::duration_millis;

/// Trim, count and conditionally insert in one server-side step.
///
/// Returns `{admitted, count, oldest_score}` where `oldest_score` is -1 for
/// an empty window.
const RECORD_WITHIN_LIMIT: &str = r#"
local key = KEYS[1]
local window_start = ARGV[1]
local now = ARGV[2]
local member = ARGV[3]
local max_requests = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', window_start)
local count = redis.call('ZCOUNT', key, '(' .. window_start, now)
local admitted = 0
if count < max_requests then
  redis.call('ZADD', key, now, member)
  redis.call('PEXPIRE', key, ttl_ms)
  count = count + 1
  admitted = 1
end

local oldest_score = -1
local oldest = redis.call(
  'ZRANGEBYSCORE', key, '(' .. window_start, now, 'WITHSCORES', 'LIMIT', 0, 1)
if oldest[2] then
  oldest_score = tonumber(oldest[2])
end
return {admitted, count, oldest_score}
"#;

/// Refill, decide and conditionally take one token in one server-side step.
///
/// Returns `{stored, tokens, last_refill_ms}`. `stored` is -1 when the key
/// holds something other than a well-formed bucket.
const TAKE_TOKEN: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_tokens = tonumber(ARGV[2])
local interval_ms = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])

local kind = redis.call('TYPE', key)['ok']
if kind ~= 'none' and kind ~= 'hash' then
  return {-1, 0, 0}
end

local tokens = capacity
local last_refill = now
if kind == 'hash' then
  local stored = redis.call('HMGET', key, 'tokens', 'last_refill_ms')
  tokens = tonumber(stored[1])
  last_refill = tonumber(stored[2])
  if tokens == nil or last_refill == nil then
    return {-1, 0, 0}
  end
end

local elapsed = now - last_refill
if elapsed >= interval_ms then
  local intervals = math.floor(elapsed / interval_ms)
  tokens = math.min(capacity, tokens + intervals * refill_tokens)
  last_refill = last_refill + intervals * interval_ms
end

if tokens < 1 then
  return {0, tokens, last_refill}
end

tokens = tokens - 1
redis.call('HSET', key, 'tokens', tokens, 'last_refill_ms', last_refill)
redis.call('PEXPIRE', key, ttl_ms)
return {1, tokens, last_refill}
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/`
    pub url: String,
    /// Prefix applied to every scope key
    pub key_prefix: String,
    /// Upper bound on a single store call
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            key_prefix: "floodgate:".to_string(),
            command_timeout: Duration::from_millis(250),
        }
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Quota store shared by all instances through Redis.
pub struct RedisStore {
    connection: ConnectionManager,
    window_script: Script,
    bucket_script: Script,
    config: RedisStoreConfig,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &sanitize_url(&self.config.url))
            .field("key_prefix", &self.config.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// Fails if the server cannot be reached now; later outages are
    /// reported per call.
    pub async fn connect(config: RedisStoreConfig) -> StoreResult<Self> {
        info!(
            url = %sanitize_url(&config.url),
            key_prefix = %config.key_prefix,
            "Connecting to Redis quota store"
        );

        let client = Client::open(config.url.as_str())?;
        let connect_timeout = config.command_timeout.max(Duration::from_secs(5));
        let connection = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))??;

        info!("Redis quota store connected");
        Ok(Self {
            connection,
            window_script: Script::new(RECORD_WITHIN_LIMIT),
            bucket_script: Script::new(TAKE_TOKEN),
            config,
        })
    }

    /// The configuration this store was created with.
    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    /// Full Redis key for a scope key.
    fn key(&self, scope_key: &str) -> String {
        format!("{}{}", self.config.key_prefix, scope_key)
    }

    /// Run a store call under the configured timeout.
    async fn bounded<T, F>(&self, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        tokio::time::timeout(self.config.command_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.config.command_timeout))?
    }
}

/// Expiry in milliseconds; a zero `PEXPIRE` would delete the key outright.
fn ttl_millis(ttl: Duration) -> i64 {
    duration_millis(ttl).max(1)
}

/// Hide the password of a Redis URL for logging.
fn sanitize_url(url: &str) -> String {
    match url.split_once('@') {
        Some((credentials, host)) => match credentials.rsplit_once(':') {
            Some((scheme_user, _password)) if scheme_user.contains("://") => {
                format!("{}:***@{}", scheme_user, host)
            }
            _ => format!("{}@{}", credentials, host),
        },
        None => url.to_string(),
    }
}

#[async_trait]
impl QuotaStore for RedisStore {
    async fn trim_and_count(
        &self,
        key: &str,
        cutoff_low: i64,
        cutoff_high: i64,
    ) -> StoreResult<u64> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        self.bounded(async {
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .zrembyscore(&key, "-inf", cutoff_low)
                .ignore()
                .zcount(&key, format!("({}", cutoff_low), cutoff_high)
                .query_async(&mut conn)
                .await?;
            Ok::<_, StoreError>(count)
        })
        .await
    }

    async fn insert_scored(&self, key: &str, member: &str, score: i64) -> StoreResult<()> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        self.bounded(async {
            let _: () = conn.zadd(&key, member, score).await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        self.bounded(async {
            let _: () = conn.pexpire(&key, ttl_millis(ttl)).await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn record_within_limit(
        &self,
        key: &str,
        admission: &WindowAdmission,
    ) -> StoreResult<WindowOutcome> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        self.bounded(async {
            let (admitted, count, oldest): (i64, u64, i64) = self
                .window_script
                .key(&key)
                .arg(admission.window_start)
                .arg(admission.now)
                .arg(&admission.member)
                .arg(admission.max_requests)
                .arg(ttl_millis(admission.ttl))
                .invoke_async(&mut conn)
                .await?;

            Ok::<_, StoreError>(WindowOutcome {
                admitted: admitted == 1,
                count,
                oldest_score: (oldest >= 0).then_some(oldest),
            })
        })
        .await
    }

    async fn atomic_update(&self, key: &str, take: &BucketTake) -> StoreResult<BucketUpdate> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        self.bounded(async {
            let (stored, tokens, last_refill_ms): (i64, i64, i64) = self
                .bucket_script
                .key(&key)
                .arg(take.params.capacity)
                .arg(take.params.refill_tokens)
                .arg(take.params.refill_interval_ms)
                .arg(take.now)
                .arg(ttl_millis(take.ttl()))
                .invoke_async(&mut conn)
                .await?;

            let state = BucketState {
                tokens: tokens.max(0) as u64,
                last_refill_ms,
            };
            match stored {
                1 => Ok(BucketUpdate::Store(state)),
                0 => Ok(BucketUpdate::Keep(state)),
                _ => Err(StoreError::Corrupt {
                    key: key.clone(),
                    reason: "record is not a token bucket".to_string(),
                }),
            }
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        self.bounded(async {
            redis::cmd("PING").query_async::<String>(&mut conn).await?;
            Ok::<_, StoreError>(())
        })
        .await
    }
}
