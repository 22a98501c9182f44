//! Shared application state for the axum router.
//!
//! [`AppState`] owns the assembled [`Pipeline`] and the long-lived components
//! it depends on:
//!
//! - **Routes**: Live route table fed by change notifications
//! - **Rate limiter**: Shared store client plus local fallback buckets
//! - **Configuration**: Runtime configuration access
//!
//! # Structured Concurrency
//!
//! Request executions and background tasks are tracked by one
//! `tokio_util::task::TaskTracker` and stopped through a `CancellationToken`.
//! Call `shutdown()` after the server has stopped accepting connections so
//! in-flight requests finish and their exit hooks run.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::filters::{self, AccessLogSink, ClientIpResolver, TracingSink, TrustedProxyConfig};
use crate::jwt::JwtVerifier;
use crate::pipeline::Pipeline;
use crate::rate_limiter::{RateLimitStore, RateLimiter, RedisTokenBucketStore, SystemClock};
use crate::routing::{RouteChangeEvent, RouteTable};
use crate::upstream::{HttpUpstream, Upstream};

/// Buffered route change notifications before senders wait.
const ROUTE_EVENT_BUFFER: usize = 64;

/// Components the pipeline is assembled from.
pub struct GatewayParts {
    pub routes: Arc<RouteTable>,
    pub rate_limiter: Arc<RateLimiter>,
    pub verifier: Arc<JwtVerifier>,
    pub upstream: Arc<dyn Upstream>,
    pub access_log: Arc<dyn AccessLogSink>,
}

impl GatewayParts {
    /// Build the production components described by `config`.
    pub fn from_config(config: &Config) -> GatewayResult<Self> {
        let routes = match &config.routes_file {
            Some(path) => RouteTable::load(path)?,
            None => {
                warn!("ROUTES_FILE not set, starting with an empty route table");
                RouteTable::new()
            }
        };

        let rate_limiter = match &config.redis_url {
            Some(url) => {
                let store = RedisTokenBucketStore::new(url, config.rate_limit_key_prefix.clone())
                    .map_err(|e| GatewayError::ConfigError(format!("Invalid REDIS_URL: {e}")))?;
                let store: Arc<dyn RateLimitStore> = Arc::new(store);
                RateLimiter::distributed(store, config.rate_limiter(), Arc::new(SystemClock))
            }
            None => RateLimiter::local(config.rate_limiter(), Arc::new(SystemClock)),
        };

        if !config.auth_enabled() {
            warn!("No JWT_SECRET or JWKS_URL set, every bearer token will be rejected");
        }

        Ok(Self {
            routes: Arc::new(routes),
            rate_limiter: Arc::new(rate_limiter),
            verifier: Arc::new(JwtVerifier::from_config(config)?),
            upstream: Arc::new(HttpUpstream::new(
                config.upstream_timeout,
                config.max_request_body_size,
            )?),
            access_log: Arc::new(TracingSink),
        })
    }
}

/// Shared application state for axum handlers.
///
/// Cheap to clone; every field is reference counted.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub rate_limiter: Arc<RateLimiter>,
    pub routes: Arc<RouteTable>,
    pub config: Arc<Config>,
    pub started_at: Instant,
    route_events: mpsc::Sender<RouteChangeEvent>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Assemble the pipeline and start background tasks.
    pub fn new(config: Config, parts: GatewayParts) -> Self {
        let task_tracker = TaskTracker::new();
        let cancellation_token = CancellationToken::new();

        let pipeline = Pipeline::builder(parts.upstream, parts.routes.clone())
            .filters(filters::standard_chain(
                parts.verifier,
                parts.rate_limiter.clone(),
                parts.access_log,
            ))
            .client_ip(ClientIpResolver::new(TrustedProxyConfig::new(
                &config.trusted_proxies,
            )))
            .task_tracker(task_tracker.clone())
            .build();
        info!(filters = ?pipeline.filter_names(), routes = parts.routes.len(), "Pipeline assembled");

        let (route_events, receiver) = mpsc::channel(ROUTE_EVENT_BUFFER);
        parts
            .routes
            .spawn_listener(receiver, &task_tracker, cancellation_token.clone());

        let state = Self {
            pipeline: Arc::new(pipeline),
            rate_limiter: parts.rate_limiter,
            routes: parts.routes,
            config: Arc::new(config),
            started_at: Instant::now(),
            route_events,
            task_tracker,
            cancellation_token,
        };

        if state.rate_limiter.has_store() {
            state.spawn_store_probe_task();
        }

        state
    }

    /// Sender for route change notifications.
    pub fn route_events(&self) -> mpsc::Sender<RouteChangeEvent> {
        self.route_events.clone()
    }

    /// Periodically ping the rate store so outages show up in the logs even
    /// while no limited traffic arrives.
    fn spawn_store_probe_task(&self) {
        let limiter = self.rate_limiter.clone();
        let period = self.config.rate_store_retry_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip first immediate tick
            let mut reachable = true;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Rate store probe task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        match limiter.probe().await {
                            Ok(()) => {
                                if !reachable {
                                    info!("Rate store probe: store reachable again");
                                }
                                reachable = true;
                                trace!("Rate store probe OK");
                            }
                            Err(e) => {
                                if reachable {
                                    warn!(error = %e, "Rate store probe failed");
                                }
                                reachable = false;
                            }
                        }
                    }
                }
            }

            debug!("Rate store probe task shutting down");
        });
    }

    /// Gracefully shutdown request executions and background tasks.
    ///
    /// 1. Signals background tasks to stop via the cancellation token
    /// 2. Closes the task tracker (no new tasks)
    /// 3. Waits for in-flight requests and tasks to complete
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
