//! Per-request state shared by the filters of one pipeline execution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{Extensions, Method};
use chrono::{DateTime, Utc};
use tracing::Span;

use crate::routing::RouteDescriptor;

/// Consumer id for requests without any resolvable identity.
pub const ANONYMOUS: &str = "anonymous";

/// Consumer id for verified tokens that carry no client claim.
pub const UNKNOWN: &str = "unknown";

/// Outcome of the authenticator for this request.
///
/// Stored in [`RequestContext::attributes`] by the auth filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    NoAuthRequired,
    TokenMissing,
    TokenInvalid,
    ConsumerNotWhitelisted,
    Authenticated { consumer_id: String },
}

/// Created at ingress, dropped after the exit-side hooks have run.
///
/// Owned by the orchestrator and lent mutably to each filter in turn, so no
/// two filters ever observe it concurrently.
#[derive(Debug)]
pub struct RequestContext {
    correlation_id: String,
    consumer_id: Option<String>,
    route: Option<Arc<RouteDescriptor>>,
    method: Method,
    path: String,
    client_ip: String,
    start: Instant,
    started_at: DateTime<Utc>,
    upstream_url: Option<String>,
    span: Span,
    entered: usize,
    /// Typed slots for ad hoc inter-filter signals.
    pub attributes: Extensions,
}

impl RequestContext {
    pub fn new(
        correlation_id: String,
        method: Method,
        path: String,
        client_ip: String,
        route: Option<Arc<RouteDescriptor>>,
    ) -> Self {
        Self {
            correlation_id,
            consumer_id: None,
            route,
            method,
            path,
            client_ip,
            start: Instant::now(),
            started_at: Utc::now(),
            upstream_url: None,
            span: Span::none(),
            entered: 0,
            attributes: Extensions::new(),
        }
    }

    /// Attach the request span so identity changes are recorded on it.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn consumer_id(&self) -> Option<&str> {
        self.consumer_id.as_deref()
    }

    /// Consumer id for reporting; "anonymous" until one is resolved.
    pub fn consumer_id_or_anonymous(&self) -> &str {
        self.consumer_id.as_deref().unwrap_or(ANONYMOUS)
    }

    pub fn set_consumer_id(&mut self, consumer_id: impl Into<String>) {
        let consumer_id = consumer_id.into();
        self.span.record("consumer_id", consumer_id.as_str());
        self.consumer_id = Some(consumer_id);
    }

    pub fn route(&self) -> Option<&Arc<RouteDescriptor>> {
        self.route.as_ref()
    }

    /// Route id label; "unmatched" when no route applies.
    pub fn route_id(&self) -> &str {
        self.route.as_ref().map_or("unmatched", |route| route.id.as_str())
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Client address used for rate-limit keys and access records.
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since ingress.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn upstream_url(&self) -> Option<&str> {
        self.upstream_url.as_deref()
    }

    pub fn set_upstream_url(&mut self, url: impl Into<String>) {
        self.upstream_url = Some(url.into());
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Number of filters whose entry side has run.
    pub fn entered(&self) -> usize {
        self.entered
    }

    pub(crate) fn mark_entered(&mut self) {
        self.entered += 1;
    }
}
