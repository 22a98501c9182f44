//! # API Gateway
//!
//! The request pipeline of an API gateway: every inbound request passes an
//! ordered chain of filters before it is proxied to the upstream selected by
//! the route table.
//!
//! - **Correlation**: `X-Correlation-ID` reused or generated, echoed back
//! - **Authentication**: JWT bearer tokens, per-route consumer whitelists
//! - **Identity**: one consistent consumer id for every later filter
//! - **Rate limiting**: distributed token buckets with local fallback
//! - **Observability**: Prometheus metrics and one access record per request
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Ops endpoints (/health, /ready)  │  Fallback → Pipeline    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Filters (correlation → auth → identity → metrics →         │
//! │           rate limit → access log)                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RateLimiter (Redis script + local LRU fallback)            │
//! │  JwtVerifier (HMAC secret or cached JWKS)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  HttpUpstream (reqwest)                                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use api_gateway::state::GatewayParts;
//! use api_gateway::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let parts = GatewayParts::from_config(&config)?;
//!     let state = AppState::new(config, parts);
//!     let app = build_router(state);
//!
//!     // Serve with into_make_service_with_connect_info::<SocketAddr>()...
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```bash
//! ROUTES_FILE=routes.json JWT_SECRET=change-me REDIS_URL=redis://127.0.0.1/ cargo run
//! ```

pub mod config;
pub mod error;
pub mod filters;
pub mod handlers;
pub mod jwt;
pub mod metrics;
pub mod pipeline;
pub mod rate_limiter;
pub mod routes;
pub mod routing;
pub mod state;
pub mod upstream;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use pipeline::{GatewayFilter, Pipeline, RequestContext};
pub use routes::build_router;
pub use state::AppState;
