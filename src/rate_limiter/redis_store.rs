//! Redis-backed token buckets.
//!
//! Each decision is a single `EVALSHA` of [`TOKEN_BUCKET_SCRIPT`], so the
//! refill, the comparison and the write-back happen atomically on the Redis
//! server. Concurrent requests from any number of gateway instances hitting
//! the same bucket are serialized by Redis and cannot overshoot the quota.
//!
//! The script reads the server clock (`TIME`) rather than trusting the
//! caller's, so instances with skewed clocks still share one timeline.
//!
//! Bucket layout: a hash at `{prefix}{route_id}:{client_key}` with fields
//! `tokens` (float) and `ts` (epoch millis), expiring after
//! [`idle_ttl_ms`](super::bucket::idle_ttl_ms).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::bucket::{BucketKey, RateLimitResult, idle_ttl_ms};
use super::{RateLimitStore, StoreError};
use crate::routing::RateLimitPolicy;

/// Default key prefix for bucket hashes.
pub const DEFAULT_KEY_PREFIX: &str = "gateway:ratelimit:";

/// Atomic refill-and-consume.
///
/// `KEYS[1]` bucket hash; `ARGV[1]` rps; `ARGV[2]` burst; `ARGV[3]` ttl ms.
/// Returns `{allowed, remaining, reset_at_ms, retry_after_ms}`.
pub const TOKEN_BUCKET_SCRIPT: &str = r"
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

local bucket = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(bucket[1])
local last = tonumber(bucket[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end
if tokens < 0 then tokens = 0 end
if tokens > capacity then tokens = capacity end

local elapsed = now - last
if elapsed < 0 then elapsed = 0 end
if now < last then now = last end
tokens = math.min(capacity, tokens + elapsed * rate / 1000)

local allowed = 0
local remaining = 0
local reset_at
local retry_after = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
  remaining = math.floor(tokens)
  reset_at = now + math.ceil((capacity - tokens) * 1000 / rate)
else
  retry_after = math.ceil((1 - tokens) * 1000 / rate)
  reset_at = now + retry_after
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(now))
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, remaining, reset_at, retry_after}
";

/// Token-bucket store shared by every gateway instance.
pub struct RedisTokenBucketStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    script: Script,
    key_prefix: String,
}

impl RedisTokenBucketStore {
    /// Create a store for `url`.
    ///
    /// The connection is established on first use, so the gateway starts even
    /// while Redis is down; decisions fall back to local buckets until it is
    /// reachable.
    pub fn new(url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            key_prefix: key_prefix.into(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                debug!("Connecting to rate limit store");
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!("Connected to rate limit store");
                Ok::<_, redis::RedisError>(manager)
            })
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl RateLimitStore for RedisTokenBucketStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn check_and_consume(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitResult, StoreError> {
        let mut connection = self.connection().await?;

        let (allowed, remaining, reset_at, retry_after): (i64, i64, i64, i64) = self
            .script
            .key(key.storage_key(&self.key_prefix))
            .arg(policy.requests_per_second)
            .arg(policy.burst_size)
            .arg(idle_ttl_ms(policy))
            .invoke_async(&mut connection)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let to_u64 = |value: i64, field: &str| {
            u64::try_from(value)
                .map_err(|_| StoreError::Protocol(format!("negative {field} in script reply")))
        };

        Ok(RateLimitResult {
            allowed: allowed == 1,
            remaining: to_u64(remaining, "remaining")?,
            reset_time_ms: to_u64(reset_at, "reset_at")?,
            retry_after_ms: to_u64(retry_after, "retry_after")?,
            limit: policy.requests_per_second,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(RedisTokenBucketStore::new("not a url", DEFAULT_KEY_PREFIX).is_err());
    }

    #[test]
    fn test_client_is_lazy() {
        // Nothing listens on this port; construction must still succeed.
        let store = RedisTokenBucketStore::new("redis://127.0.0.1:1/", DEFAULT_KEY_PREFIX);
        assert!(store.is_ok());
    }
}
