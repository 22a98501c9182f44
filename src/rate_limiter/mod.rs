//! Distributed token-bucket rate limiting with local fallback.
//!
//! [`RateLimiter::check_and_consume`] is the single entry point used by the
//! rate-limit filter. It never fails:
//!
//! - With a shared store configured and healthy, every decision is one atomic
//!   round-trip to the store, bounded by a timeout.
//! - When the store errors or times out, the decision is made by an in-process
//!   [`LocalTokenBucketStore`] using this instance's share of the quota. A
//!   [`CircuitBreaker`] stops consulting a store that keeps failing.
//! - When the store answers again, local fallback state is discarded without
//!   reconciliation.

pub mod bucket;
pub mod circuit_breaker;
pub mod clock;
pub mod local;
pub mod redis_store;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use bucket::{BucketKey, BucketState, RateLimitResult};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use local::{DEFAULT_LOCAL_CAPACITY, LocalTokenBucketStore};
pub use redis_store::RedisTokenBucketStore;

use crate::error::GatewayError;
use crate::metrics;
use crate::routing::RateLimitPolicy;

/// Failure talking to a bucket store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),

    #[error("rate limit store timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply from rate limit store: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Label for the fallback counter.
    pub fn reason(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Timeout(_) => "timeout",
            StoreError::Protocol(_) => "protocol",
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::RateStoreUnavailable(err.to_string())
    }
}

/// Atomic refill-and-consume against some bucket storage.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Backend label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Refill the bucket for `key` and try to take one token, atomically.
    async fn check_and_consume(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitResult, StoreError>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Tunables for [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Upper bound for one store round-trip.
    pub store_timeout: Duration,
    /// Maximum number of buckets kept by the local fallback.
    pub fallback_capacity: NonZeroUsize,
    /// Number of gateway instances sharing the quota during an outage.
    pub fallback_instances: u32,
    pub breaker: CircuitBreakerConfig,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(50),
            fallback_capacity: DEFAULT_LOCAL_CAPACITY,
            fallback_instances: 1,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Where a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The shared store.
    Distributed,
    /// Local buckets because the store failed or was skipped.
    Fallback,
    /// Local buckets because no store is configured.
    Local,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Distributed => "distributed",
            Backend::Fallback => "fallback",
            Backend::Local => "local",
        }
    }
}

/// Result of [`RateLimiter::check_and_consume`] together with its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub result: RateLimitResult,
    pub backend: Backend,
}

/// Rate limiter shared by all requests of one gateway instance.
pub struct RateLimiter {
    store: Option<Arc<dyn RateLimitStore>>,
    fallback: LocalTokenBucketStore,
    breaker: CircuitBreaker,
    store_timeout: Duration,
    fallback_instances: u32,
    degraded: AtomicBool,
}

impl RateLimiter {
    /// Limiter that consults `store` and falls back to local buckets.
    pub fn distributed(
        store: Arc<dyn RateLimitStore>,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            backend = store.name(),
            timeout = ?config.store_timeout,
            fallback_instances = config.fallback_instances,
            "Rate limiter using shared store"
        );
        Self::build(Some(store), config, clock)
    }

    /// Limiter backed by local buckets only.
    pub fn local(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        info!("Rate limiter using local buckets only");
        Self::build(None, config, clock)
    }

    fn build(
        store: Option<Arc<dyn RateLimitStore>>,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            fallback: LocalTokenBucketStore::new(config.fallback_capacity, clock),
            breaker: CircuitBreaker::new(config.breaker),
            store_timeout: config.store_timeout,
            fallback_instances: config.fallback_instances.max(1),
            degraded: AtomicBool::new(false),
        }
    }

    /// Refill and consume one token for `(route_id, client_key)`.
    ///
    /// Always produces a decision; store failures are absorbed here.
    pub async fn check_and_consume(
        &self,
        route_id: &str,
        client_key: &str,
        policy: &RateLimitPolicy,
    ) -> Decision {
        let key = BucketKey::new(route_id, client_key);

        let Some(store) = &self.store else {
            let result = self.fallback.decide(&key, policy);
            return self.finish(route_id, result, Backend::Local);
        };

        if !self.breaker.allow_request().await {
            metrics::record_rate_store_fallback("breaker_open");
            return self.decide_locally(&key, policy);
        }

        let outcome = match tokio::time::timeout(
            self.store_timeout,
            store.check_and_consume(&key, policy),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        };

        match outcome {
            Ok(result) => {
                self.breaker.record_success().await;
                if self.degraded.swap(false, Ordering::AcqRel) {
                    let discarded = self.fallback.len();
                    self.fallback.clear();
                    info!(
                        backend = store.name(),
                        discarded_buckets = discarded,
                        "Rate limit store recovered, local fallback state discarded"
                    );
                }
                self.finish(route_id, result, Backend::Distributed)
            }
            Err(err) => {
                self.breaker.record_failure().await;
                metrics::record_rate_store_fallback(err.reason());
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    warn!(
                        backend = store.name(),
                        error = %err,
                        "Rate limit store failed, falling back to local buckets"
                    );
                } else {
                    debug!(error = %err, bucket = %key, "Rate limit store still failing");
                }
                self.decide_locally(&key, policy)
            }
        }
    }

    fn decide_locally(&self, key: &BucketKey, policy: &RateLimitPolicy) -> Decision {
        self.degraded.store(true, Ordering::Release);
        let share = policy.share(self.fallback_instances);
        let mut result = self.fallback.decide(key, &share);
        // Clients see the configured limit, not this instance's share of it.
        result.limit = policy.requests_per_second;
        self.finish(&key.route_id, result, Backend::Fallback)
    }

    fn finish(&self, route_id: &str, result: RateLimitResult, backend: Backend) -> Decision {
        metrics::record_rate_limit_decision(route_id, result.allowed, backend.as_str());
        Decision { result, backend }
    }

    /// Whether decisions are currently served by the local fallback.
    pub fn is_degraded(&self) -> bool {
        self.store.is_some() && self.degraded.load(Ordering::Acquire)
    }

    /// Whether a shared store is configured at all.
    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Label for the mode decisions are currently made in.
    pub fn mode(&self) -> &'static str {
        match (&self.store, self.is_degraded()) {
            (None, _) => Backend::Local.as_str(),
            (Some(_), true) => Backend::Fallback.as_str(),
            (Some(_), false) => Backend::Distributed.as_str(),
        }
    }

    /// Ping the shared store, if any.
    pub async fn probe(&self) -> Result<(), StoreError> {
        match &self.store {
            Some(store) => {
                tokio::time::timeout(self.store_timeout.max(Duration::from_millis(250)), store.ping())
                    .await
                    .map_err(|_| StoreError::Timeout(self.store_timeout))?
            }
            None => Ok(()),
        }
    }

    pub async fn breaker_state(&self) -> CircuitState {
        self.breaker.state().await
    }

    /// Number of buckets held by the local fallback.
    pub fn local_buckets(&self) -> usize {
        self.fallback.len()
    }
}
