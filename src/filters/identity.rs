//! Consumer identity resolution.
//!
//! First match wins:
//!
//! 1. The id established by the authenticator, unless blank or a sentinel
//! 2. `X-Consumer-ID`, if at most [`MAX_CONSUMER_ID_LEN`] characters of
//!    `[A-Za-z0-9._-]`
//! 3. [`ANONYMOUS`]
//!
//! The header bound keeps metric label cardinality finite and keeps control
//! characters out of log lines. Invalid headers are ignored, never rejected.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, Response};
use tracing::debug;

use crate::error::GatewayResult;
use crate::pipeline::{ANONYMOUS, GatewayFilter, Next, RequestContext, UNKNOWN, order};
use crate::upstream::CONSUMER_ID_HEADER;

/// Longest accepted `X-Consumer-ID` value.
pub const MAX_CONSUMER_ID_LEN: usize = 64;

/// Whether `value` is an acceptable client-supplied consumer id.
pub fn is_valid_consumer_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_CONSUMER_ID_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

fn is_established(consumer_id: Option<&str>) -> bool {
    consumer_id.is_some_and(|id| !id.trim().is_empty() && id != ANONYMOUS && id != UNKNOWN)
}

/// Pick the consumer id for a request.
pub fn resolve(established: Option<&str>, headers: &HeaderMap) -> String {
    if is_established(established)
        && let Some(id) = established
    {
        return id.to_string();
    }

    if let Some(value) = headers.get(CONSUMER_ID_HEADER) {
        match value.to_str() {
            Ok(id) if is_valid_consumer_id(id) => return id.to_string(),
            _ => debug!("Ignoring invalid X-Consumer-ID header"),
        }
    }

    ANONYMOUS.to_string()
}

/// Writes the resolved consumer id back into the context.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFilter;

#[async_trait]
impl GatewayFilter for IdentityFilter {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn order(&self) -> i32 {
        order::IDENTITY
    }

    async fn filter(
        &self,
        ctx: &mut RequestContext,
        req: Request<Body>,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>> {
        let consumer_id = resolve(ctx.consumer_id(), req.headers());
        if ctx.consumer_id() != Some(consumer_id.as_str()) {
            ctx.set_consumer_id(consumer_id);
        }
        next.run(ctx, req).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONSUMER_ID_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_token_identity_wins() {
        assert_eq!(resolve(Some("partner-a"), &headers("spoofed")), "partner-a");
    }

    #[test]
    fn test_sentinels_fall_through_to_header() {
        assert_eq!(resolve(Some(UNKNOWN), &headers("mobile.app_v2")), "mobile.app_v2");
        assert_eq!(resolve(Some(ANONYMOUS), &headers("mobile.app_v2")), "mobile.app_v2");
        assert_eq!(resolve(Some("   "), &headers("mobile.app_v2")), "mobile.app_v2");
    }

    #[test]
    fn test_invalid_header_is_ignored() {
        assert_eq!(resolve(None, &headers("has space")), ANONYMOUS);
        assert_eq!(resolve(None, &headers("semi;colon")), ANONYMOUS);
        assert_eq!(resolve(None, &headers(&"x".repeat(65))), ANONYMOUS);
        assert_eq!(resolve(None, &headers(&"x".repeat(64))), "x".repeat(64));
    }

    #[test]
    fn test_anonymous_without_signals() {
        assert_eq!(resolve(None, &HeaderMap::new()), ANONYMOUS);
    }

    #[test]
    fn test_consumer_id_charset() {
        assert!(is_valid_consumer_id("Partner_A-1.0"));
        assert!(!is_valid_consumer_id(""));
        assert!(!is_valid_consumer_id("ünïcode"));
        assert!(!is_valid_consumer_id("line\nbreak"));
    }
}
