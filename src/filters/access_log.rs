//! One structured access record per request.
//!
//! The record is assembled in the exit hook, after the final status is known,
//! and handed to an [`AccessLogSink`]. Sink failures are logged and dropped;
//! the response has already been produced by then.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::GatewayResult;
use crate::pipeline::{Completion, GatewayFilter, Next, RequestContext, order};

/// Tracing target used by [`TracingSink`].
pub const ACCESS_LOG_TARGET: &str = "gateway::access";

/// Completion record for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogRecord {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub consumer_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_url: Option<String>,
    pub client_ip: String,
}

impl AccessLogRecord {
    pub fn from_context(ctx: &RequestContext, completion: &Completion) -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: ctx.correlation_id().to_string(),
            consumer_id: ctx.consumer_id_or_anonymous().to_string(),
            method: ctx.method().to_string(),
            path: ctx.path().to_string(),
            status: completion.status.as_u16(),
            duration_ms: u64::try_from(completion.duration.as_millis()).unwrap_or(u64::MAX),
            upstream_url: ctx.upstream_url().map(str::to_string),
            client_ip: ctx.client_ip().to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AccessLogError {
    #[error("Access log sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for access records.
pub trait AccessLogSink: Send + Sync {
    fn emit(&self, record: &AccessLogRecord) -> Result<(), AccessLogError>;
}

/// Emits records as `info` events on [`ACCESS_LOG_TARGET`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AccessLogSink for TracingSink {
    fn emit(&self, record: &AccessLogRecord) -> Result<(), AccessLogError> {
        info!(
            target: ACCESS_LOG_TARGET,
            timestamp = %record.timestamp.to_rfc3339(),
            correlation_id = %record.correlation_id,
            consumer_id = %record.consumer_id,
            method = %record.method,
            path = %record.path,
            status = record.status,
            duration_ms = record.duration_ms,
            upstream_url = record.upstream_url.as_deref().unwrap_or("-"),
            client_ip = %record.client_ip,
            "Request completed"
        );
        Ok(())
    }
}

/// Produces the access record for every request.
pub struct AccessLogFilter {
    sink: Arc<dyn AccessLogSink>,
}

impl AccessLogFilter {
    pub fn new(sink: Arc<dyn AccessLogSink>) -> Self {
        Self { sink }
    }
}

impl Default for AccessLogFilter {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

#[async_trait]
impl GatewayFilter for AccessLogFilter {
    fn name(&self) -> &'static str {
        "access_log"
    }

    fn order(&self) -> i32 {
        order::ACCESS_LOG
    }

    async fn filter(
        &self,
        ctx: &mut RequestContext,
        req: Request<Body>,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>> {
        next.run(ctx, req).await
    }

    fn on_complete(&self, ctx: &RequestContext, completion: &Completion) {
        let record = AccessLogRecord::from_context(ctx, completion);
        if let Err(err) = self.sink.emit(&record) {
            warn!(error = %err, correlation_id = %record.correlation_id, "Dropped access record");
        }
    }
}
