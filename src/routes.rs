//! Application router.
//!
//! # Request Flow
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ├── /health, /ready ──► ops handlers (no filters)
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Pipeline     │ ← correlation → auth → identity → metrics
//! │                  │   → rate limit → access log → upstream
//! └──────────────────┘
//! ```
//!
//! Everything that is not an ops endpoint is handled by the fallback, so
//! routing to upstreams is decided by the route table rather than by axum.
//! Serve with `into_make_service_with_connect_info::<SocketAddr>()` so the
//! peer address is available as a client key.

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .fallback(handlers::proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
