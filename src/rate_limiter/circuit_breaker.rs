//! Circuit breaker guarding the distributed rate-limit store.
//!
//! While the store is healthy every decision goes to it. After
//! `failure_threshold` consecutive failures or timeouts the breaker opens and
//! decisions go straight to the local fallback, so requests stop paying the
//! store timeout during an outage. After `open_duration` a single probe is
//! let through at a time; success closes the breaker, failure reopens it.
//!
//! A closed breaker with no failures is answered from an atomic flag, so
//! healthy decisions never take the state lock.
//!
//! ```text
//!   Closed ──failures ≥ threshold──► Open
//!     ▲                               │ open_duration elapsed
//!     │ successes ≥ threshold         ▼
//!     └──────────────────────────  HalfOpen ──failure──► Open
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::metrics;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Store in use.
    Closed,
    /// Store skipped, local fallback only.
    Open,
    /// Probing the store.
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for the state gauge.
    pub fn as_gauge(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long the store is skipped before probing.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            open_duration: Duration::from_secs(5),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            open_duration,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Start of the half-open probe currently in flight.
    probe_started: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            probe_started: None,
        }
    }
}

/// Thread-safe breaker shared by all request tasks of one instance.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<BreakerState>,
    /// Closed with no failures recorded since.
    healthy: AtomicBool,
    times_opened: AtomicU32,
    calls_skipped: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(BreakerState::new()),
            healthy: AtomicBool::new(true),
            times_opened: AtomicU32::new(0),
            calls_skipped: AtomicU64::new(0),
        }
    }

    /// Whether the store should be consulted for this decision.
    pub async fn allow_request(&self) -> bool {
        if self.healthy.load(Ordering::Acquire) {
            return true;
        }

        {
            let state = self.state.read().await;
            if state.state == CircuitState::Closed {
                return true;
            }
            if !self.probe_due(&state) {
                self.calls_skipped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        let mut state = self.state.write().await;
        if state.state == CircuitState::Closed {
            return true;
        }
        if !self.probe_due(&state) {
            self.calls_skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if state.state == CircuitState::Open {
            state.state = CircuitState::HalfOpen;
            state.consecutive_successes = 0;
            metrics::set_rate_store_breaker_state(CircuitState::HalfOpen.as_gauge());
            info!("Rate store breaker half-open, probing store");
        }
        state.probe_started = Some(Instant::now());
        true
    }

    /// Open long enough, or half-open with no live probe. A probe whose
    /// outcome was never recorded expires after `open_duration`.
    fn probe_due(&self, state: &BreakerState) -> bool {
        match state.state {
            CircuitState::Closed => false,
            CircuitState::Open => state
                .opened_at
                .is_none_or(|opened_at| opened_at.elapsed() >= self.config.open_duration),
            CircuitState::HalfOpen => state
                .probe_started
                .is_none_or(|started| started.elapsed() >= self.config.open_duration),
        }
    }

    pub async fn record_success(&self) {
        if self.healthy.load(Ordering::Acquire) {
            return;
        }

        let mut state = self.state.write().await;

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
                self.healthy.store(true, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                state.probe_started = None;
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.opened_at = None;
                    state.consecutive_failures = 0;
                    self.healthy.store(true, Ordering::Release);
                    metrics::set_rate_store_breaker_state(CircuitState::Closed.as_gauge());
                    info!("Rate store breaker closed");
                }
            }
            CircuitState::Open => {
                // A decision that started before the breaker opened.
                debug!("Store success recorded while breaker open");
            }
        }
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        self.healthy.store(false, Ordering::Release);

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    self.times_opened.fetch_add(1, Ordering::Relaxed);
                    metrics::set_rate_store_breaker_state(CircuitState::Open.as_gauge());
                    warn!(
                        failures = state.consecutive_failures,
                        retry_in = ?self.config.open_duration,
                        "Rate store breaker opened, using local fallback"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.consecutive_successes = 0;
                state.probe_started = None;
                self.times_opened.fetch_add(1, Ordering::Relaxed);
                metrics::set_rate_store_breaker_state(CircuitState::Open.as_gauge());
                warn!("Rate store probe failed, breaker reopened");
            }
            CircuitState::Open => {
                state.opened_at = Some(Instant::now());
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    /// Decisions that bypassed the store because the breaker was open.
    pub fn calls_skipped(&self) -> u64 {
        self.calls_skipped.load(Ordering::Relaxed)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_starts_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.allow_request().await);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(3, 1, Duration::from_secs(30)));

        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert_eq!(cb.times_opened(), 1);
        assert!(!cb.allow_request().await);
        assert_eq!(cb.calls_skipped(), 1);
    }

    #[tokio::test]
    async fn test_probe_success_closes() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(1, 1, Duration::from_millis(10)));

        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cb.allow_request().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(1, 1, Duration::from_millis(10)));

        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.allow_request().await);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert_eq!(cb.times_opened(), 2);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(2, 1, Duration::from_secs(30)));

        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_one_probe_at_a_time() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(1, 2, Duration::from_millis(50)));

        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(cb.allow_request().await);
        assert!(!cb.allow_request().await);
        assert!(!cb.allow_request().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        // First success frees the slot for the second probe.
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        assert!(cb.allow_request().await);
        assert!(!cb.allow_request().await);

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.allow_request().await);
        assert!(cb.allow_request().await);
    }

    #[tokio::test]
    async fn test_concurrent_half_open_requests_send_one_probe() {
        let cb = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::new(
            1,
            1,
            Duration::from_millis(20),
        )));
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let cb = cb.clone();
            tasks.push(tokio::spawn(async move { cb.allow_request().await }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_abandoned_probe_expires() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(1, 1, Duration::from_millis(20)));

        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cb.allow_request().await);
        assert!(!cb.allow_request().await);

        // The first probe never reports back.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cb.allow_request().await);
    }

    #[tokio::test]
    async fn test_healthy_breaker_stays_closed_under_successes() {
        let cb = CircuitBreaker::default();
        for _ in 0..100 {
            assert!(cb.allow_request().await);
            cb.record_success().await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.calls_skipped(), 0);
    }

    #[test]
    fn test_gauge_encoding() {
        assert_eq!(CircuitState::Closed.as_gauge(), 0);
        assert_eq!(CircuitState::HalfOpen.as_gauge(), 1);
        assert_eq!(CircuitState::Open.as_gauge(), 2);
    }
}
