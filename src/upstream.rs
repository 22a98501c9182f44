//! Terminal step of the pipeline: proxy the request to the route's upstream.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes, to_bytes};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Response, Uri};
use http_body_util::LengthLimitError;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::filters::correlation::CORRELATION_ID_HEADER;
use crate::pipeline::RequestContext;

/// Header carrying the resolved consumer id to the upstream.
pub const CONSUMER_ID_HEADER: &str = "x-consumer-id";

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Sends a request that has passed every filter to its destination.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(
        &self,
        ctx: &RequestContext,
        req: Request<Body>,
    ) -> GatewayResult<Response<Body>>;
}

/// Join the route's base URL with the request path and query.
pub fn target_url(base: &str, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    format!("{}{}", base.trim_end_matches('/'), path_and_query)
}

/// HTTP reverse proxy built on a pooled reqwest client.
#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    max_body_size: usize,
}

impl HttpUpstream {
    pub fn new(timeout: Duration, max_body_size: usize) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::ConfigError(format!("Cannot build upstream client: {e}")))?;
        Ok(Self {
            client,
            max_body_size,
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(
        &self,
        ctx: &RequestContext,
        req: Request<Body>,
    ) -> GatewayResult<Response<Body>> {
        let url = match ctx.upstream_url() {
            Some(url) => url.to_string(),
            None => {
                let route = ctx
                    .route()
                    .ok_or_else(|| GatewayError::RouteNotFound(ctx.path().to_string()))?;
                target_url(&route.upstream, req.uri())
            }
        };

        let (parts, body) = req.into_parts();
        let body = read_body(&parts.headers, body, self.max_body_size).await?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        if let Ok(value) = HeaderValue::from_str(ctx.correlation_id()) {
            headers.insert(CORRELATION_ID_HEADER, value);
        }
        if let Some(consumer_id) = ctx.consumer_id()
            && let Ok(value) = HeaderValue::from_str(consumer_id)
        {
            headers.insert(CONSUMER_ID_HEADER, value);
        }

        debug!(url = %url, method = %parts.method, "Forwarding to upstream");

        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Upstream call failed");
                if e.is_timeout() {
                    GatewayError::UpstreamTimeout(url.clone())
                } else {
                    GatewayError::UpstreamUnreachable(format!("{url}: {e}"))
                }
            })?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(out) = response.headers_mut() {
            for (name, value) in upstream.headers() {
                if !HOP_BY_HOP.contains(name) && name != header::CONTENT_LENGTH {
                    out.append(name.clone(), value.clone());
                }
            }
        }

        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| GatewayError::Internal(format!("Failed to build upstream response: {e}")))
    }
}

/// Buffer a request body of at most `limit` bytes.
///
/// A declared or actual length above the limit is a 413.
pub async fn read_body(headers: &HeaderMap, body: Body, limit: usize) -> GatewayResult<Bytes> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(length) = declared
        && length > limit as u64
    {
        return Err(GatewayError::PayloadTooLarge { limit });
    }

    to_bytes(body, limit).await.map_err(|err| {
        if exceeds_limit(&err) {
            GatewayError::PayloadTooLarge { limit }
        } else {
            GatewayError::Internal(format!("Failed to read request body: {err}"))
        }
    })
}

fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if current.is::<LengthLimitError>() {
            return true;
        }
        source = current.source();
    }
    false
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by Connection are hop-by-hop as well.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}
