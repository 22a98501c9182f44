//! Correlation id propagation.
//!
//! - Reuses an inbound `X-Correlation-ID` verbatim
//! - Generates a UUIDv4 when the header is absent or empty
//! - Writes the id to the request headers forwarded upstream and to the
//!   response headers returned to the client
//!
//! The id is resolved once at ingress by the orchestrator and stored in the
//! [`RequestContext`]; this filter only performs the header writes.
//!
//! ```bash
//! curl -H "X-Correlation-ID: abc-123" http://localhost:8080/api/orders
//! ```

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{HeaderMap, Request, Response};
use tracing::debug;
use uuid::Uuid;

use crate::error::GatewayResult;
use crate::pipeline::{GatewayFilter, Next, RequestContext, order};

/// Header name for the correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Reuse the inbound correlation id or generate a new one.
pub fn resolve(headers: &HeaderMap) -> String {
    if let Some(header_value) = headers.get(CORRELATION_ID_HEADER)
        && let Ok(value) = header_value.to_str()
        && !value.trim().is_empty()
    {
        return value.to_string();
    }

    Uuid::new_v4().to_string()
}

/// Writes the context's correlation id to request and response headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationFilter;

#[async_trait]
impl GatewayFilter for CorrelationFilter {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn order(&self) -> i32 {
        order::CORRELATION
    }

    async fn filter(
        &self,
        ctx: &mut RequestContext,
        mut req: Request<Body>,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>> {
        let value = HeaderValue::from_str(ctx.correlation_id()).ok();
        if let Some(value) = &value {
            req.headers_mut().insert(CORRELATION_ID_HEADER, value.clone());
        }
        debug!("Processing request");

        let mut response = next.run(ctx, req).await?;

        if let Some(value) = value {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value);
        }
        Ok(response)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_id_is_reused_verbatim() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_ID_HEADER, HeaderValue::from_static("abc-123"));

        assert_eq!(resolve(&headers), "abc-123");
    }

    #[test]
    fn test_missing_id_is_generated() {
        let id = resolve(&HeaderMap::new());

        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_blank_id_is_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_ID_HEADER, HeaderValue::from_static("  "));

        assert!(Uuid::parse_str(&resolve(&headers)).is_ok());
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(resolve(&HeaderMap::new()), resolve(&HeaderMap::new()));
    }
}
