//! Health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness with rate-limit backend details
//! - `GET /ready` - Kubernetes-compatible readiness probe
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Returns 200 even if degraded, includes details
//! - **Readiness** (`/ready`): Returns 503 while the configured rate store is
//!   unavailable and decisions are served by local fallback buckets
//!
//! Both are served outside the filter chain: no auth, no rate limiting.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::state::AppState;

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "healthy" or "degraded"
    pub status: String,
    /// "distributed", "fallback" or "local"
    pub rate_limit_backend: String,
    /// Breaker state of the shared store, when one is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_store_breaker: Option<String>,
    pub routes: usize,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// Health check endpoint.
///
/// Always returns 200 OK with status details in the body.
///
/// ```json
/// {
///   "status": "healthy",
///   "rate_limit_backend": "distributed",
///   "rate_store_breaker": "closed",
///   "routes": 3,
///   "version": "0.1.0",
///   "uptime_seconds": 3600,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let limiter = &state.rate_limiter;
    let rate_store_breaker = if limiter.has_store() {
        Some(limiter.breaker_state().await.to_string())
    } else {
        None
    };

    Json(HealthResponse {
        status: if limiter.is_degraded() {
            "degraded"
        } else {
            "healthy"
        }
        .to_string(),
        rate_limit_backend: limiter.mode().to_string(),
        rate_store_breaker,
        routes: state.routes.len(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// ```yaml
/// readinessProbe:
///   httpGet:
///     path: /ready
///     port: 8080
///   periodSeconds: 10
/// ```
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<StatusCode, StatusCode> {
    if state.rate_limiter.is_degraded() {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    } else {
        Ok(StatusCode::OK)
    }
}
