//! Redis-backed counter store.
//!
//! Every trait operation is a single Lua script evaluated server-side,
//! which is what makes check-and-consume atomic across processes and
//! instances sharing one Redis. The multiplexed connection manager is the
//! shared, bounded path to the backend: it never blocks indefinitely, and
//! connection failures surface as [`StoreError`] for the circuit breaker.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::info;

use super::backend::{BucketOutcome, CounterStore, StoreError, WindowOutcome};

/// Token bucket refill-and-consume.
///
/// Returns `{allowed, tostring(tokens_after)}`; tokens travel as strings
/// because Lua replies truncate numbers to integers.
const CONSUME_TOKENS_SCRIPT: &str = r#"
local key = KEYS[1]
local max_tokens = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil then
    tokens = max_tokens
    last_refill = now
end

local elapsed = now - last_refill
if elapsed < 0 then
    elapsed = 0
end
local refilled = tokens + elapsed * refill_rate
if refilled > max_tokens then
    refilled = max_tokens
end

local allowed = 0
if refilled >= requested then
    allowed = 1
    tokens = refilled - requested
else
    tokens = refilled
end
if now > last_refill then
    last_refill = now
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'last_refill', tostring(last_refill))
redis.call('PEXPIRE', key, ttl_ms)
return {allowed, tostring(tokens)}
"#;

/// Sliding window prune-count-append over a sorted set.
const RECORD_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])
local member = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
    allowed = 1
    redis.call('ZADD', key, now, member)
    count = count + 1
end
redis.call('PEXPIRE', key, ttl_ms)

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = ''
if oldest[2] then
    oldest_score = oldest[2]
end
return {allowed, count, oldest_score}
"#;

/// Violation append with pruning and a hard cap on log length.
const RECORD_VIOLATION_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max_entries = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])
local member = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
redis.call('ZADD', key, now, member)
local count = redis.call('ZCARD', key)
local excess = count - max_entries
if excess > 0 then
    redis.call('ZREMRANGEBYRANK', key, 0, excess - 1)
    count = max_entries
end
redis.call('PEXPIRE', key, ttl_ms)
return count
"#;

/// Pruning read of the violation count.
const VIOLATION_COUNT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
return redis.call('ZCARD', key)
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1/`
    pub url: String,
    /// Prefix applied to every key
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            key_prefix: String::new(),
        }
    }
}

/// Redis-backed counter store shared by all engine instances.
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: String,
    consume_script: Script,
    window_script: Script,
    violation_script: Script,
    count_script: Script,
    /// Distinguishes sorted-set members created in the same clock tick
    member_seq: AtomicU64,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with default configuration.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(RedisStoreConfig {
            url: url.to_string(),
            ..RedisStoreConfig::default()
        })
        .await
    }

    /// Connect with custom configuration.
    pub async fn connect_with_config(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;

        info!(url = %config.url, "Connected counter store to Redis");

        Ok(Self {
            connection,
            key_prefix: config.key_prefix,
            consume_script: Script::new(CONSUME_TOKENS_SCRIPT),
            window_script: Script::new(RECORD_WINDOW_SCRIPT),
            violation_script: Script::new(RECORD_VIOLATION_SCRIPT),
            count_script: Script::new(VIOLATION_COUNT_SCRIPT),
            member_seq: AtomicU64::new(0),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn next_member(&self, now: f64) -> String {
        let seq = self.member_seq.fetch_add(1, Ordering::Relaxed);
        format!("{:.6}-{}", now, seq)
    }
}

fn ttl_ms(ttl_secs: f64) -> i64 {
    ((ttl_secs * 1000.0).ceil() as i64).max(1)
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else if err.is_connection_refusal() || err.is_io_error() || err.is_connection_dropped() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn consume_tokens(
        &self,
        key: &str,
        max_tokens: f64,
        refill_rate: f64,
        requested: f64,
        now: f64,
        ttl_secs: f64,
    ) -> Result<BucketOutcome, StoreError> {
        let mut conn = self.connection.clone();
        let (allowed, tokens): (i64, String) = self
            .consume_script
            .key(self.prefixed(key))
            .arg(max_tokens)
            .arg(refill_rate)
            .arg(requested)
            .arg(now)
            .arg(ttl_ms(ttl_secs))
            .invoke_async(&mut conn)
            .await?;

        let tokens: f64 = tokens
            .parse()
            .map_err(|_| StoreError::Protocol(format!("bad token count '{}'", tokens)))?;

        Ok(BucketOutcome {
            allowed: allowed == 1,
            tokens,
        })
    }

    async fn record_window(
        &self,
        key: &str,
        limit: u64,
        window_secs: f64,
        now: f64,
        ttl_secs: f64,
    ) -> Result<WindowOutcome, StoreError> {
        let mut conn = self.connection.clone();
        let (allowed, count, oldest): (i64, u64, String) = self
            .window_script
            .key(self.prefixed(key))
            .arg(limit)
            .arg(window_secs)
            .arg(now)
            .arg(ttl_ms(ttl_secs))
            .arg(self.next_member(now))
            .invoke_async(&mut conn)
            .await?;

        let oldest = if oldest.is_empty() {
            None
        } else {
            Some(oldest.parse().map_err(|_| {
                StoreError::Protocol(format!("bad window timestamp '{}'", oldest))
            })?)
        };

        Ok(WindowOutcome {
            allowed: allowed == 1,
            count,
            oldest,
        })
    }

    async fn record_violation(
        &self,
        key: &str,
        now: f64,
        window_secs: f64,
        max_entries: usize,
        ttl_secs: f64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: u64 = self
            .violation_script
            .key(self.prefixed(key))
            .arg(now)
            .arg(window_secs)
            .arg(max_entries as u64)
            .arg(ttl_ms(ttl_secs))
            .arg(self.next_member(now))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn violation_count(
        &self,
        key: &str,
        now: f64,
        window_secs: f64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: u64 = self
            .count_script
            .key(self.prefixed(key))
            .arg(now)
            .arg(window_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }
}
