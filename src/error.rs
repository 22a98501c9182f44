use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, HeaderValue, WWW_AUTHENTICATE};
use axum::http::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Base URI for the `type` member of every problem body.
pub const PROBLEM_TYPE_BASE: &str = "https://api.gateway/errors/";

/// Media type of all rejection bodies.
pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// Gateway-wide error taxonomy.
///
/// Variants that reach a client are rendered as [`ProblemDetails`]. Two variants
/// never leave the process: `RateStoreUnavailable` is recovered by the local
/// fallback limiter, and `ConfigError` only occurs at startup.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("Authentication required: {0}")]
    AuthenticationMissing(String),

    #[error("Invalid credentials: {0}")]
    AuthenticationInvalid(String),

    #[error("Consumer '{consumer_id}' is not allowed on route '{route_id}'")]
    AuthorizationDenied {
        consumer_id: String,
        route_id: String,
    },

    #[error("Rate limit exceeded on route '{route_id}'")]
    RateLimitExceeded { route_id: String },

    #[error("No route matches path: {0}")]
    RouteNotFound(String),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Rate limit store unavailable: {0}")]
    RateStoreUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl GatewayError {
    /// HTTP status surfaced to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AuthenticationMissing(_) | GatewayError::AuthenticationInvalid(_) => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::AuthorizationDenied { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::RateStoreUnavailable(_)
            | GatewayError::Internal(_)
            | GatewayError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable slug appended to [`PROBLEM_TYPE_BASE`].
    pub fn slug(&self) -> &'static str {
        match self {
            GatewayError::AuthenticationMissing(_) | GatewayError::AuthenticationInvalid(_) => {
                "unauthorized"
            }
            GatewayError::AuthorizationDenied { .. } => "forbidden",
            GatewayError::RateLimitExceeded { .. } => "rate-limit-exceeded",
            GatewayError::RouteNotFound(_) => "not-found",
            GatewayError::PayloadTooLarge { .. } => "payload-too-large",
            GatewayError::UpstreamUnreachable(_) => "bad-gateway",
            GatewayError::UpstreamTimeout(_) => "gateway-timeout",
            GatewayError::RateStoreUnavailable(_)
            | GatewayError::Internal(_)
            | GatewayError::ConfigError(_) => "internal-error",
        }
    }

    /// Human readable title.
    pub fn title(&self) -> &'static str {
        match self {
            GatewayError::AuthenticationMissing(_) | GatewayError::AuthenticationInvalid(_) => {
                "Unauthorized"
            }
            GatewayError::AuthorizationDenied { .. } => "Forbidden",
            GatewayError::RateLimitExceeded { .. } => "Too Many Requests",
            GatewayError::RouteNotFound(_) => "Not Found",
            GatewayError::PayloadTooLarge { .. } => "Payload Too Large",
            GatewayError::UpstreamUnreachable(_) => "Bad Gateway",
            GatewayError::UpstreamTimeout(_) => "Gateway Timeout",
            GatewayError::RateStoreUnavailable(_)
            | GatewayError::Internal(_)
            | GatewayError::ConfigError(_) => "Internal Server Error",
        }
    }

    /// Detail string that is safe to show to clients.
    ///
    /// Internal variants are sanitized; their full text is only logged.
    pub fn client_detail(&self) -> String {
        match self {
            GatewayError::AuthenticationMissing(msg) | GatewayError::AuthenticationInvalid(msg) => {
                msg.clone()
            }
            GatewayError::AuthorizationDenied { .. } => {
                "Consumer is not allowed to access this route".to_string()
            }
            GatewayError::RateLimitExceeded { .. } => {
                "Rate limit exceeded. Please retry later.".to_string()
            }
            GatewayError::RouteNotFound(_) => "No route matches the request path".to_string(),
            GatewayError::PayloadTooLarge { limit } => {
                format!("Request body exceeds the limit of {limit} bytes")
            }
            GatewayError::UpstreamUnreachable(_) => {
                "The upstream service is unreachable".to_string()
            }
            GatewayError::UpstreamTimeout(_) => {
                "The upstream service did not respond in time".to_string()
            }
            GatewayError::RateStoreUnavailable(_)
            | GatewayError::Internal(_)
            | GatewayError::ConfigError(_) => "An internal error occurred".to_string(),
        }
    }

    /// Render this error as a problem response for the given request.
    pub fn into_problem_response(self, instance: &str, correlation_id: &str) -> Response<Body> {
        if self.status().is_server_error() {
            tracing::error!(error = %self, correlation_id, "Request failed");
        }
        let status = self.status();
        let mut response =
            ProblemDetails::from_error(&self, instance, correlation_id).into_response(status);
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Problem body shared by every rejection path.
///
/// ```json
/// {
///   "type": "https://api.gateway/errors/rate-limit-exceeded",
///   "title": "Too Many Requests",
///   "status": 429,
///   "detail": "Rate limit exceeded. Please retry later.",
///   "instance": "/api/orders",
///   "correlationId": "1b9d6bcd-..."
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
    pub correlation_id: String,
}

impl ProblemDetails {
    pub fn from_error(error: &GatewayError, instance: &str, correlation_id: &str) -> Self {
        Self {
            problem_type: format!("{PROBLEM_TYPE_BASE}{}", error.slug()),
            title: error.title().to_string(),
            status: error.status().as_u16(),
            detail: error.client_detail(),
            instance: instance.to_string(),
            correlation_id: correlation_id.to_string(),
        }
    }

    /// Serialize into a response with the problem content type.
    pub fn into_response(self, status: StatusCode) -> Response<Body> {
        let body = serde_json::to_vec(&self).unwrap_or_else(|_| {
            br#"{"type":"https://api.gateway/errors/internal-error","title":"Internal Server Error","status":500}"#
                .to_vec()
        });

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
        );
        response
    }
}

/// Convenience type alias for Results with GatewayError.
pub type GatewayResult<T> = Result<T, GatewayError>;
