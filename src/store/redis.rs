//! Redis-backed admission store.
//!
//! Shares admission state across limiter instances through a single
//! Redis deployment. Every algorithm runs as an atomic server-side Lua
//! script, so the read-compute-write sequence for one key executes as
//! one indivisible operation and two concurrent callers can never both
//! observe the last unit of capacity.
//!
//! Storage keys are `<prefix><algorithm>:<logical key>`. Before a script
//! runs, the stored value's type is checked against what the algorithm
//! expects; a mismatch (the caller switched algorithms for this key)
//! deletes the stale state and proceeds as if absent rather than failing.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, trace, warn};

use super::{Decision, Store};
use crate::config::Algorithm;
use crate::error::{Result, TollgateError};

const DEFAULT_PREFIX: &str = "ratelimit:";

/// Redis-backed admission store.
///
/// Token-bucket `remaining` values are fractional tokens floored to an
/// integer. Denial reset hints are rounded up to whole seconds so a
/// caller never retries before capacity actually exists.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connect to Redis and verify the server is reachable.
    pub async fn connect(url: &str) -> Result<Self> {
        debug!(url = %url, "Connecting to redis admission store");

        let client = redis::Client::open(url)
            .map_err(|e| TollgateError::StoreInit(format!("invalid redis url: {}", e)))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| TollgateError::StoreInit(format!("redis connection failed: {}", e)))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| TollgateError::StoreInit(format!("redis ping failed: {}", e)))?;

        Ok(Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    /// Connect with a custom storage key prefix.
    pub async fn connect_with_prefix(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let mut store = Self::connect(url).await?;
        store.prefix = prefix.into();
        Ok(store)
    }

    /// Wrap an already-established connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    fn storage_key(&self, algorithm: Algorithm, key: &str) -> String {
        format!("{}{}:{}", self.prefix, algorithm, key)
    }

    /// Delete state written by a different algorithm under this key.
    async fn ensure_key_type(
        &self,
        conn: &mut ConnectionManager,
        storage_key: &str,
        expected: &str,
    ) -> Result<()> {
        let actual: String = redis::cmd("TYPE")
            .arg(storage_key)
            .query_async(conn)
            .await?;

        if actual == "none" || actual == expected {
            return Ok(());
        }

        warn!(
            key = %storage_key,
            found = %actual,
            expected = %expected,
            "Resetting admission state written by another algorithm"
        );
        let _: () = conn.del(storage_key).await?;
        Ok(())
    }

    async fn fixed_window_take(
        &self,
        conn: &mut ConnectionManager,
        storage_key: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<Decision> {
        self.ensure_key_type(conn, storage_key, "string").await?;

        let script = redis::Script::new(
            r#"
            local key = KEYS[1]
            local window = tonumber(ARGV[1])
            local max_requests = tonumber(ARGV[2])
            local now = tonumber(ARGV[3])

            local current = tonumber(redis.call('GET', key) or '0')

            if current >= max_requests then
                local ttl = redis.call('TTL', key)
                if ttl < 0 then
                    ttl = window
                end
                return {0, 0, now + ttl}
            end

            redis.call('INCR', key)
            if current == 0 then
                redis.call('EXPIRE', key, window)
            end
            return {1, max_requests - current - 1, now + window}
            "#,
        );

        let (allowed, remaining, reset): (i64, i64, i64) = script
            .key(storage_key)
            .arg(window.as_secs().max(1))
            .arg(max_requests)
            .arg(unix_secs(SystemTime::now()))
            .invoke_async(conn)
            .await?;

        Ok(decision(allowed, remaining, Duration::from_secs(reset.max(0) as u64)))
    }

    async fn sliding_window_take(
        &self,
        conn: &mut ConnectionManager,
        storage_key: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<Decision> {
        self.ensure_key_type(conn, storage_key, "zset").await?;

        // Timestamps are scored in microseconds so near-simultaneous
        // requests occupy distinct set members.
        let script = redis::Script::new(
            r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local window = tonumber(ARGV[2])
            local max_requests = tonumber(ARGV[3])
            local ttl = tonumber(ARGV[4])

            redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
            local current = redis.call('ZCARD', key)

            if current >= max_requests then
                local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
                if #oldest == 0 then
                    return {0, 0, now + window}
                end
                return {0, 0, tonumber(oldest[2]) + window}
            end

            redis.call('ZADD', key, now, now)
            redis.call('EXPIRE', key, ttl)
            return {1, max_requests - current - 1, now + window}
            "#,
        );

        let now = SystemTime::now();
        let now_us = now.duration_since(UNIX_EPOCH).unwrap().as_micros() as u64;
        let window_us = window.as_micros() as u64;

        let (allowed, remaining, reset): (i64, i64, i64) = script
            .key(storage_key)
            .arg(now_us)
            .arg(window_us)
            .arg(max_requests)
            .arg(window.as_secs().max(1))
            .invoke_async(conn)
            .await?;

        Ok(decision(allowed, remaining, Duration::from_micros(reset.max(0) as u64)))
    }

    async fn token_bucket_take(
        &self,
        conn: &mut ConnectionManager,
        storage_key: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<Decision> {
        self.ensure_key_type(conn, storage_key, "hash").await?;

        let script = redis::Script::new(
            r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local window = tonumber(ARGV[2])
            local max_requests = tonumber(ARGV[3])
            local ttl = tonumber(ARGV[4])
            local fill_rate = max_requests / window

            if redis.call('EXISTS', key) == 0 then
                local tokens = max_requests - 1
                redis.call('HMSET', key, 'tokens', tokens, 'lastUpdate', now)
                redis.call('EXPIRE', key, ttl)
                return {1, math.floor(tokens), math.ceil(now + (max_requests - tokens) / fill_rate)}
            end

            local bucket = redis.call('HMGET', key, 'tokens', 'lastUpdate')
            local tokens = tonumber(bucket[1]) or max_requests
            local last_update = tonumber(bucket[2]) or now

            tokens = math.min(max_requests, tokens + (now - last_update) * fill_rate)

            if tokens < 1 then
                return {0, 0, math.ceil(now + (1 - tokens) / fill_rate)}
            end

            tokens = tokens - 1
            redis.call('HMSET', key, 'tokens', tokens, 'lastUpdate', now)
            redis.call('EXPIRE', key, ttl)
            return {1, math.floor(tokens), math.ceil(now + (max_requests - tokens) / fill_rate)}
            "#,
        );

        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();

        let (allowed, remaining, reset): (i64, i64, i64) = script
            .key(storage_key)
            .arg(now_secs)
            .arg(window.as_secs_f64())
            .arg(max_requests)
            .arg(window.as_secs().max(1))
            .invoke_async(conn)
            .await?;

        Ok(decision(allowed, remaining, Duration::from_secs(reset.max(0) as u64)))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn take(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
        algorithm: Algorithm,
    ) -> Result<Decision> {
        trace!(key = %key, algorithm = %algorithm, "Redis admission check");

        let storage_key = self.storage_key(algorithm, key);
        let mut conn = self.conn.clone();

        match algorithm {
            Algorithm::FixedWindow => {
                self.fixed_window_take(&mut conn, &storage_key, max_requests, window)
                    .await
            }
            Algorithm::SlidingWindow => {
                self.sliding_window_take(&mut conn, &storage_key, max_requests, window)
                    .await
            }
            Algorithm::TokenBucket => {
                self.token_bucket_take(&mut conn, &storage_key, max_requests, window)
                    .await
            }
        }
    }

    /// Refund one unit for the fixed-window counter, or one token for a
    /// token bucket, whichever exists for this key. Sliding-window
    /// admissions are never retracted: the timestamp entry stays in the
    /// set, so a caller rolling back a sliding-window admission does not
    /// recover that slot.
    async fn rollback(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        // Guarded by EXISTS so a refund never creates state (or a
        // negative count) for an uncharged key.
        let fixed_key = self.storage_key(Algorithm::FixedWindow, key);
        let script = redis::Script::new(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 0 then
                return 0
            end
            local value = redis.call('DECR', KEYS[1])
            if value <= 0 then
                redis.call('DEL', KEYS[1])
            end
            return 1
            "#,
        );
        let refunded: i64 = script.key(&fixed_key).invoke_async(&mut conn).await?;
        if refunded == 1 {
            trace!(key = %key, "Refunded fixed-window charge");
            return Ok(());
        }

        let bucket_key = self.storage_key(Algorithm::TokenBucket, key);
        let script = redis::Script::new(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 0 then
                return 0
            end
            redis.call('HINCRBYFLOAT', KEYS[1], 'tokens', 1)
            return 1
            "#,
        );
        let refunded: i64 = script.key(&bucket_key).invoke_async(&mut conn).await?;
        if refunded == 1 {
            trace!(key = %key, "Refunded token-bucket charge");
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();

        let fixed_key = self.storage_key(Algorithm::FixedWindow, key);
        if let Ok(Some(count)) = conn.get::<_, Option<u64>>(&fixed_key).await {
            return Ok(count);
        }

        let bucket_key = self.storage_key(Algorithm::TokenBucket, key);
        if let Ok(Some(tokens)) = conn.hget::<_, _, Option<f64>>(&bucket_key, "tokens").await {
            return Ok(tokens.floor() as u64);
        }

        let sliding_key = self.storage_key(Algorithm::SlidingWindow, key);
        let cardinality: u64 = conn.zcard(&sliding_key).await?;
        Ok(cardinality)
    }

    async fn set(&self, _key: &str, _value: u64, _expiration: Duration) -> Result<()> {
        // A single scalar cannot represent zset or hash state.
        Err(TollgateError::Store(
            "set is not supported by the redis store".to_string(),
        ))
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn decision(allowed: i64, remaining: i64, reset_since_epoch: Duration) -> Decision {
    let reset_at = UNIX_EPOCH + reset_since_epoch;
    if allowed == 1 {
        Decision::allowed(remaining.max(0) as u64, reset_at)
    } else {
        Decision::denied(reset_at)
    }
}
