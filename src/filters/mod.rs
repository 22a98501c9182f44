//! Built-in gateway filters.
//!
//! # Chain Order
//!
//! | Order | Filter                  | Short-circuits with |
//! |-------|-------------------------|---------------------|
//! | 1     | [`CorrelationFilter`]   | never               |
//! | 2     | [`JwtAuthFilter`]       | 401, 403            |
//! | 3     | [`IdentityFilter`]      | never               |
//! | 4     | [`MetricsFilter`]       | never               |
//! | 5     | [`RateLimitFilter`]     | 429                 |
//! | 6     | upstream proxy          |                     |
//! | 7     | [`AccessLogFilter`]     | never               |
//!
//! The access log sits after the proxy position; its record is produced by
//! its exit hook, which the orchestrator runs for every request.

pub mod access_log;
pub mod auth;
pub mod correlation;
pub mod identity;
pub mod ip;
pub mod metrics;
pub mod rate_limit;

use std::sync::Arc;

pub use access_log::{AccessLogFilter, AccessLogRecord, AccessLogSink, TracingSink};
pub use auth::JwtAuthFilter;
pub use correlation::CorrelationFilter;
pub use identity::IdentityFilter;
pub use ip::{ClientIpResolver, TrustedProxyConfig};
pub use metrics::MetricsFilter;
pub use rate_limit::RateLimitFilter;

use crate::jwt::JwtVerifier;
use crate::pipeline::GatewayFilter;
use crate::rate_limiter::RateLimiter;

/// The standard chain, in registration order.
pub fn standard_chain(
    verifier: Arc<JwtVerifier>,
    limiter: Arc<RateLimiter>,
    access_log: Arc<dyn AccessLogSink>,
) -> Vec<Arc<dyn GatewayFilter>> {
    vec![
        Arc::new(CorrelationFilter),
        Arc::new(JwtAuthFilter::new(verifier)),
        Arc::new(IdentityFilter),
        Arc::new(MetricsFilter::new()),
        Arc::new(RateLimitFilter::new(limiter)),
        Arc::new(AccessLogFilter::new(access_log)),
    ]
}
