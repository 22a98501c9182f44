//! Prometheus metrics for the gateway pipeline.
//!
//! Metrics are exposed via a dedicated HTTP listener (default port 9090).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_requests_total` - Requests completed (labels: route_id, method, status_class)
//! - `gateway_request_errors_total` - Requests with status >= 400 (labels: route_id, error_type)
//! - `gateway_rate_limit_decisions_total` - Limiter decisions (labels: route_id, outcome, backend)
//! - `gateway_rate_store_fallbacks_total` - Decisions served locally because the store failed (labels: reason)
//! - `gateway_jwks_refresh_total` - Key-set fetches (labels: outcome)
//!
//! ## Histograms
//! - `gateway_request_duration_seconds` - End-to-end latency from ingress (labels: route_id, method)
//!
//! ## Gauges
//! - `gateway_requests_in_flight` - Requests currently inside the metrics filter
//! - `gateway_rate_store_breaker_state` - Store breaker state (0 = closed, 1 = half-open, 2 = open)
//!
//! # Usage
//!
//! ```rust,ignore
//! use api_gateway::metrics::{init_metrics, record_request};
//!
//! init_metrics("0.0.0.0:9090".parse()?)?;
//! record_request("orders", "GET", "2xx", 0.012);
//! ```
//!
//! All recording helpers are no-ops until a recorder is installed.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const REQUEST_ERRORS_TOTAL: &str = "gateway_request_errors_total";
    pub const REQUESTS_IN_FLIGHT: &str = "gateway_requests_in_flight";
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "gateway_rate_limit_decisions_total";
    pub const RATE_STORE_FALLBACKS_TOTAL: &str = "gateway_rate_store_fallbacks_total";
    pub const RATE_STORE_BREAKER_STATE: &str = "gateway_rate_store_breaker_state";
    pub const JWKS_REFRESH_TOTAL: &str = "gateway_jwks_refresh_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Starts the HTTP listener on `metrics_addr` and registers descriptions for
/// every gateway metric.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_metrics();

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Register metric descriptions with whatever recorder is installed.
pub fn describe_metrics() {
    describe_counter!(
        names::REQUESTS_TOTAL,
        "Total number of requests processed by the gateway"
    );
    describe_counter!(
        names::REQUEST_ERRORS_TOTAL,
        "Total number of requests answered with status >= 400, by error type"
    );
    describe_counter!(
        names::RATE_LIMIT_DECISIONS_TOTAL,
        "Rate limiter decisions by outcome and backend"
    );
    describe_counter!(
        names::RATE_STORE_FALLBACKS_TOTAL,
        "Decisions served by the local fallback because the shared store failed"
    );
    describe_counter!(
        names::JWKS_REFRESH_TOTAL,
        "Key-set fetch attempts by outcome"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "End-to-end request latency in seconds, measured from ingress"
    );

    describe_gauge!(
        names::REQUESTS_IN_FLIGHT,
        "Requests currently being processed"
    );
    describe_gauge!(
        names::RATE_STORE_BREAKER_STATE,
        "Rate store breaker state (0 = closed, 1 = half-open, 2 = open)"
    );
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

/// Status class label for a response status.
pub fn status_class(status: Option<u16>) -> &'static str {
    match status {
        Some(200..=299) => "2xx",
        Some(300..=399) => "3xx",
        Some(400..=499) => "4xx",
        Some(500..=599) => "5xx",
        _ => "unknown",
    }
}

/// Error classification for a status >= 400; `None` below that.
pub fn error_type(status: u16) -> Option<&'static str> {
    match status {
        0..=399 => None,
        429 => Some("rate_limited"),
        404 => Some("not_found"),
        502 | 504 => Some("upstream_error"),
        401 | 403 => Some("auth_error"),
        400..=499 => Some("client_error"),
        _ => Some("internal_error"),
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record one completed request: counter and latency histogram.
pub fn record_request(route_id: &str, method: &str, status_class: &str, duration_secs: f64) {
    counter!(names::REQUESTS_TOTAL, "route_id" => route_id.to_string(), "method" => method.to_string(), "status_class" => status_class.to_string())
        .increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "route_id" => route_id.to_string(), "method" => method.to_string())
        .record(duration_secs);
}

/// Record a request that ended with an error status.
pub fn record_request_error(route_id: &str, error_type: &str) {
    counter!(names::REQUEST_ERRORS_TOTAL, "route_id" => route_id.to_string(), "error_type" => error_type.to_string())
        .increment(1);
}

/// Record a rate-limit decision.
pub fn record_rate_limit_decision(route_id: &str, allowed: bool, backend: &'static str) {
    let outcome = if allowed { "allowed" } else { "rejected" };
    counter!(names::RATE_LIMIT_DECISIONS_TOTAL, "route_id" => route_id.to_string(), "outcome" => outcome, "backend" => backend)
        .increment(1);
}

/// Record a decision served locally because the shared store could not be used.
pub fn record_rate_store_fallback(reason: &'static str) {
    counter!(names::RATE_STORE_FALLBACKS_TOTAL, "reason" => reason).increment(1);
}

/// Record a key-set fetch.
pub fn record_jwks_refresh(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(names::JWKS_REFRESH_TOTAL, "outcome" => outcome).increment(1);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

/// A request entered the metrics filter.
///
/// The gauge is only ever moved relatively; absolute sets from concurrent
/// requests can land out of order.
pub fn increment_requests_in_flight() {
    gauge!(names::REQUESTS_IN_FLIGHT).increment(1.0);
}

/// A request that entered the metrics filter completed.
pub fn decrement_requests_in_flight() {
    gauge!(names::REQUESTS_IN_FLIGHT).decrement(1.0);
}

/// Update the rate store breaker gauge.
///
/// States: 0 = closed, 1 = half-open, 2 = open
pub fn set_rate_store_breaker_state(state: u8) {
    gauge!(names::RATE_STORE_BREAKER_STATE).set(f64::from(state));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(Some(200)), "2xx");
        assert_eq!(status_class(Some(204)), "2xx");
        assert_eq!(status_class(Some(301)), "3xx");
        assert_eq!(status_class(Some(429)), "4xx");
        assert_eq!(status_class(Some(503)), "5xx");
        assert_eq!(status_class(Some(101)), "unknown");
        assert_eq!(status_class(None), "unknown");
    }

    #[test]
    fn test_error_type_classification() {
        assert_eq!(error_type(200), None);
        assert_eq!(error_type(304), None);
        assert_eq!(error_type(429), Some("rate_limited"));
        assert_eq!(error_type(404), Some("not_found"));
        assert_eq!(error_type(502), Some("upstream_error"));
        assert_eq!(error_type(504), Some("upstream_error"));
        assert_eq!(error_type(401), Some("auth_error"));
        assert_eq!(error_type(403), Some("auth_error"));
        assert_eq!(error_type(400), Some("client_error"));
        assert_eq!(error_type(422), Some("client_error"));
        assert_eq!(error_type(500), Some("internal_error"));
        assert_eq!(error_type(503), Some("internal_error"));
    }

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        record_request("orders", "GET", "2xx", 0.1);
        record_request_error("orders", "rate_limited");
        record_rate_limit_decision("orders", true, "redis");
        record_rate_store_fallback("timeout");
        record_jwks_refresh(false);
        increment_requests_in_flight();
        decrement_requests_in_flight();
        set_rate_store_breaker_state(2);
    }
}
