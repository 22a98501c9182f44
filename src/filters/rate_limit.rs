//! Per-route rate limiting.
//!
//! Buckets are keyed by `(route id, client address)`. Routes without a
//! policy are unlimited and the filter passes them through untouched.
//!
//! # Response Headers
//!
//! On every limited route:
//! - `X-RateLimit-Limit`: Configured requests per second
//! - `X-RateLimit-Remaining`: Tokens left after this request
//! - `X-RateLimit-Reset`: Epoch seconds when the bucket is usable again
//!
//! On rate limit exceeded (429), additionally:
//! - `Retry-After`: Seconds until the next request will be accepted (min 1)
//!
//! Store outages never surface here: [`RateLimiter`] always returns a
//! decision, served by local buckets when the shared store is unavailable.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::{HeaderMap, Request, Response};
use tracing::warn;

use crate::error::{GatewayError, GatewayResult};
use crate::pipeline::{GatewayFilter, Next, RequestContext, order};
use crate::rate_limiter::{RateLimitResult, RateLimiter};

pub const RATE_LIMIT_LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING_HEADER: HeaderName =
    HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Attach the `X-RateLimit-*` headers for `result`.
pub fn apply_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(result.limit));
    headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(result.remaining));
    headers.insert(RATE_LIMIT_RESET_HEADER, HeaderValue::from(result.reset_epoch_secs()));
}

/// Enforces the matched route's rate-limit policy.
pub struct RateLimitFilter {
    limiter: Arc<RateLimiter>,
}

impl RateLimitFilter {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl GatewayFilter for RateLimitFilter {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn order(&self) -> i32 {
        order::RATE_LIMIT
    }

    async fn filter(
        &self,
        ctx: &mut RequestContext,
        req: Request<Body>,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>> {
        let Some(policy) = ctx.route().and_then(|route| route.rate_limit) else {
            return next.run(ctx, req).await;
        };

        let decision = self
            .limiter
            .check_and_consume(ctx.route_id(), ctx.client_ip(), &policy)
            .await;
        let result = decision.result;

        if !result.allowed {
            let retry_after = result.retry_after_secs();
            warn!(
                client_ip = %ctx.client_ip(),
                route_id = %ctx.route_id(),
                backend = decision.backend.as_str(),
                retry_after_secs = retry_after,
                "Rate limit exceeded"
            );

            let mut response = GatewayError::RateLimitExceeded {
                route_id: ctx.route_id().to_string(),
            }
            .into_problem_response(ctx.path(), ctx.correlation_id());
            let headers = response.headers_mut();
            apply_headers(headers, &result);
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
            return Ok(response);
        }

        let mut response = next.run(ctx, req).await?;
        apply_headers(response.headers_mut(), &result);
        Ok(response)
    }
}
