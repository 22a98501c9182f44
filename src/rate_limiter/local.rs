//! In-process token-bucket store.
//!
//! Serves two roles:
//!
//! - the degraded-mode fallback of [`RateLimiter`](super::RateLimiter) while
//!   the distributed store is unreachable, and
//! - the only store when no distributed store is configured (single instance).
//!
//! Buckets live in a bounded LRU map so that a flood of distinct client keys
//! cannot grow memory without limit; an evicted bucket simply starts full the
//! next time it is seen.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use super::bucket::{self, BucketKey, BucketState, RateLimitResult};
use super::clock::Clock;
use super::{RateLimitStore, StoreError};
use crate::routing::RateLimitPolicy;

/// Default number of buckets kept in memory.
pub const DEFAULT_LOCAL_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10_000) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

/// Bounded, mutex-protected bucket map.
pub struct LocalTokenBucketStore {
    buckets: Mutex<LruCache<BucketKey, BucketState>>,
    clock: Arc<dyn Clock>,
}

impl LocalTokenBucketStore {
    pub fn new(capacity: NonZeroUsize, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(LruCache::new(capacity)),
            clock,
        }
    }

    /// Refill and consume atomically with respect to other callers.
    pub fn decide(&self, key: &BucketKey, policy: &RateLimitPolicy) -> RateLimitResult {
        let now = self.clock.now_millis();
        let mut buckets = self.buckets.lock();
        let (state, result) = bucket::consume(buckets.get(key).copied(), policy, now);
        buckets.put(key.clone(), state);
        result
    }

    /// Current state of a bucket, without refilling it.
    pub fn peek(&self, key: &BucketKey) -> Option<BucketState> {
        self.buckets.lock().peek(key).copied()
    }

    /// Forget every bucket.
    pub fn clear(&self) {
        self.buckets.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }
}

#[async_trait]
impl RateLimitStore for LocalTokenBucketStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn check_and_consume(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitResult, StoreError> {
        Ok(self.decide(key, policy))
    }
}
