//! Token-bucket arithmetic shared by every store.
//!
//! One bucket exists per `(routeId, clientKey)` pair. It starts full, refills
//! continuously at `requestsPerSecond` up to `burstSize`, and each allowed
//! request consumes one token:
//!
//! ```text
//! elapsed  = now - lastRefillAt
//! tokens   = min(burst, tokens + elapsed * rps)
//! tokens >= 1  → allow, tokens -= 1, resetTime = when the bucket is full again
//! tokens <  1  → reject,             resetTime = when one token is available
//! lastRefillAt = now
//! ```
//!
//! [`consume`] is the reference implementation. The Redis store runs the
//! same steps inside a Lua script so that they execute atomically on the
//! server; the local store runs [`consume`] under a mutex.

use std::fmt;

use crate::routing::RateLimitPolicy;

/// Identifies one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub route_id: String,
    pub client_key: String,
}

impl BucketKey {
    pub fn new(route_id: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            client_key: client_key.into(),
        }
    }

    /// Key under which the bucket is stored in a shared store.
    ///
    /// The route id is length-prefixed so that ids and client keys containing
    /// `:` cannot produce the same key for different buckets.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!(
            "{prefix}{}:{}:{}",
            self.route_id.len(),
            self.route_id,
            self.client_key
        )
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.route_id, self.client_key)
    }
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Available tokens, within `[0, burstSize]`.
    pub tokens: f64,
    /// Epoch millis of the last refill.
    pub last_refill_ms: u64,
}

/// Outcome of a single admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Tokens left after this decision, floor-rounded.
    pub remaining: u64,
    /// Epoch millis: full capacity again (allowed) or next token (rejected).
    pub reset_time_ms: u64,
    /// Millis until a retry can succeed; zero when allowed.
    pub retry_after_ms: u64,
    /// Sustained rate reported in `X-RateLimit-Limit`.
    pub limit: u32,
}

impl RateLimitResult {
    /// `X-RateLimit-Reset` value in epoch seconds.
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_time_ms.div_ceil(1000)
    }

    /// `Retry-After` value in whole seconds, never below 1.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.div_ceil(1000).max(1)
    }
}

/// Refill the bucket and try to take one token.
///
/// `state` is `None` for a bucket that has never been seen (or has expired),
/// which is treated as full.
pub fn consume(
    state: Option<BucketState>,
    policy: &RateLimitPolicy,
    now_ms: u64,
) -> (BucketState, RateLimitResult) {
    let capacity = f64::from(policy.burst_size.max(1));
    let rate = f64::from(policy.requests_per_second.max(1));

    let (tokens, last_refill_ms) = match state {
        Some(state) => (state.tokens.clamp(0.0, capacity), state.last_refill_ms),
        None => (capacity, now_ms),
    };

    // A clock that went backwards refills nothing.
    let elapsed_ms = now_ms.saturating_sub(last_refill_ms);
    let refilled = (tokens + elapsed_ms as f64 * rate / 1000.0).min(capacity);
    let refilled_at = now_ms.max(last_refill_ms);

    if refilled >= 1.0 {
        let left = refilled - 1.0;
        let state = BucketState {
            tokens: left,
            last_refill_ms: refilled_at,
        };
        let result = RateLimitResult {
            allowed: true,
            remaining: left.floor() as u64,
            reset_time_ms: refilled_at + millis_to_refill(capacity - left, rate),
            retry_after_ms: 0,
            limit: policy.requests_per_second,
        };
        (state, result)
    } else {
        let wait_ms = millis_to_refill(1.0 - refilled, rate);
        let state = BucketState {
            tokens: refilled,
            last_refill_ms: refilled_at,
        };
        let result = RateLimitResult {
            allowed: false,
            remaining: 0,
            reset_time_ms: refilled_at + wait_ms,
            retry_after_ms: wait_ms,
            limit: policy.requests_per_second,
        };
        (state, result)
    }
}

/// Milliseconds needed to accumulate `deficit` tokens.
fn millis_to_refill(deficit: f64, rate: f64) -> u64 {
    if deficit <= 0.0 {
        return 0;
    }
    (deficit * 1000.0 / rate).ceil() as u64
}

/// Store expiry for a bucket: twice the time to refill from empty, at least 1s.
///
/// A bucket idle that long is full, so dropping it is indistinguishable from
/// keeping it.
pub fn idle_ttl_ms(policy: &RateLimitPolicy) -> u64 {
    let full_refill = millis_to_refill(
        f64::from(policy.burst_size.max(1)),
        f64::from(policy.requests_per_second.max(1)),
    );
    (full_refill * 2).max(1000)
}
