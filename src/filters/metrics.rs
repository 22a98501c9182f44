//! Request metrics.
//!
//! The entry side only raises the in-flight gauge. Everything else happens in
//! the exit hook, which the orchestrator runs for every request, so requests
//! rejected by earlier filters (401/403) are still counted and rate-limit
//! rejections are timed end to end.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};

use crate::error::GatewayResult;
use crate::metrics;
use crate::pipeline::{Completion, GatewayFilter, Next, RequestContext, order};

/// Records request counters, latency and the in-flight gauge.
#[derive(Debug, Default)]
pub struct MetricsFilter {
    in_flight: AtomicU64,
}

impl MetricsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests whose entry side ran but whose exit hook has not.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }
}

#[async_trait]
impl GatewayFilter for MetricsFilter {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn order(&self) -> i32 {
        order::METRICS
    }

    async fn filter(
        &self,
        ctx: &mut RequestContext,
        req: Request<Body>,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        metrics::increment_requests_in_flight();
        next.run(ctx, req).await
    }

    fn on_complete(&self, ctx: &RequestContext, completion: &Completion) {
        if completion.entered {
            let decremented = self
                .in_flight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if decremented {
                metrics::decrement_requests_in_flight();
            }
        }

        let status = completion.status.as_u16();
        let route_id = ctx.route_id();
        let method = ctx.method().as_str();
        metrics::record_request(
            route_id,
            method,
            metrics::status_class(Some(status)),
            completion.duration.as_secs_f64(),
        );
        if let Some(error_type) = metrics::error_type(status) {
            metrics::record_request_error(route_id, error_type);
        }
    }
}
