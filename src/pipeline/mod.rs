//! Filter chain orchestrator.
//!
//! A [`Pipeline`] owns an ordered list of [`GatewayFilter`]s and the terminal
//! [`Upstream`]. Every inbound request becomes one execution:
//!
//! ```text
//! ingress ─► correlation ─► auth ─► identity ─► metrics ─► rate limit ─► access log ─► upstream
//!               │             │                               │
//!               └─────────────┴── short-circuit (401/403/429) ┘
//!
//! exit-side hooks (reverse order, every filter, exactly once):
//!   access log ◄─ rate limit ◄─ metrics ◄─ identity ◄─ auth ◄─ correlation
//! ```
//!
//! Filters run strictly in ascending [`GatewayFilter::order`], ties broken by
//! registration order. A filter continues the chain by calling
//! [`Next::run`]; returning without calling it ends the chain and its
//! response is final.
//!
//! The exit-side hooks ([`GatewayFilter::on_complete`]) are invoked by the
//! orchestrator, not by the filters, so they run for every request: when a
//! filter short-circuits, returns an error, or panics, and when the client
//! disconnects mid-request (the execution runs in its own task).

pub mod context;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response, StatusCode};
use futures::FutureExt;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, field, info_span, warn};

pub use context::{ANONYMOUS, AuthState, RequestContext, UNKNOWN};

use crate::error::{GatewayError, GatewayResult};
use crate::filters::correlation::{self, CORRELATION_ID_HEADER};
use crate::filters::ip::ClientIpResolver;
use crate::routing::RouteTable;
use crate::upstream::{Upstream, target_url};

/// Chain positions of the built-in filters.
pub mod order {
    pub const CORRELATION: i32 = 1;
    pub const AUTH: i32 = 2;
    pub const IDENTITY: i32 = 3;
    pub const METRICS: i32 = 4;
    pub const RATE_LIMIT: i32 = 5;
    /// Position 6 is the upstream proxy, which is always last.
    pub const ACCESS_LOG: i32 = 7;
}

/// What the exit-side hooks learn about a finished request.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Final response status.
    pub status: StatusCode,
    /// Whether this filter's entry side ran.
    pub entered: bool,
    /// Time since ingress.
    pub duration: Duration,
}

/// One unit of the request pipeline.
#[async_trait]
pub trait GatewayFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Chain position; lower runs first.
    fn order(&self) -> i32;

    /// Entry side. Call `next.run(ctx, req)` to continue the chain.
    async fn filter(
        &self,
        ctx: &mut RequestContext,
        req: Request<Body>,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>>;

    /// Exit side, invoked exactly once per request for every registered
    /// filter, whether or not its entry side ran.
    fn on_complete(&self, _ctx: &RequestContext, _completion: &Completion) {}
}

/// The remainder of the chain after the current filter.
pub struct Next<'a> {
    filters: &'a [Arc<dyn GatewayFilter>],
    upstream: &'a dyn Upstream,
}

impl<'a> Next<'a> {
    fn new(filters: &'a [Arc<dyn GatewayFilter>], upstream: &'a dyn Upstream) -> Self {
        Self { filters, upstream }
    }

    /// Invoke the next filter, or the upstream once all filters have run.
    pub async fn run(
        self,
        ctx: &mut RequestContext,
        req: Request<Body>,
    ) -> GatewayResult<Response<Body>> {
        match self.filters.split_first() {
            Some((filter, rest)) => {
                ctx.mark_entered();
                filter
                    .filter(ctx, req, Next::new(rest, self.upstream))
                    .await
            }
            None => {
                let route = ctx
                    .route()
                    .cloned()
                    .ok_or_else(|| GatewayError::RouteNotFound(ctx.path().to_string()))?;
                ctx.set_upstream_url(target_url(&route.upstream, req.uri()));
                self.upstream.forward(ctx, req).await
            }
        }
    }
}

/// The assembled request pipeline.
pub struct Pipeline {
    filters: Vec<Arc<dyn GatewayFilter>>,
    upstream: Arc<dyn Upstream>,
    routes: Arc<RouteTable>,
    client_ip: ClientIpResolver,
    tracker: TaskTracker,
}

impl Pipeline {
    pub fn builder(upstream: Arc<dyn Upstream>, routes: Arc<RouteTable>) -> PipelineBuilder {
        PipelineBuilder {
            filters: Vec::new(),
            upstream,
            routes,
            client_ip: ClientIpResolver::default(),
            tracker: TaskTracker::new(),
        }
    }

    /// Filter names in execution order.
    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Process one request to completion.
    ///
    /// The execution is spawned onto the runtime, so dropping the returned
    /// future (client disconnect) does not skip exit-side hooks.
    pub async fn handle(self: &Arc<Self>, req: Request<Body>) -> Response<Body> {
        let correlation_id = correlation::resolve(req.headers());
        let path = req.uri().path().to_string();

        let pipeline = Arc::clone(self);
        let task_correlation_id = correlation_id.clone();
        let task = self
            .tracker
            .spawn(async move { pipeline.execute(task_correlation_id, req).await });

        match task.await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, correlation_id = %correlation_id, "Pipeline task aborted");
                let mut response = GatewayError::Internal(err.to_string())
                    .into_problem_response(&path, &correlation_id);
                set_correlation_header(&mut response, &correlation_id);
                response
            }
        }
    }

    async fn execute(self: Arc<Self>, correlation_id: String, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let client_ip = self.client_ip.resolve(&req);
        let route = self.routes.find(&path);

        let span = info_span!(
            "request",
            correlation_id = %correlation_id,
            method = %method,
            path = %path,
            route_id = route.as_ref().map_or("unmatched", |r| r.id.as_str()),
            consumer_id = field::Empty,
        );

        let mut ctx = RequestContext::new(correlation_id, method, path, client_ip, route)
            .with_span(span.clone());

        let outcome = AssertUnwindSafe(
            Next::new(&self.filters, self.upstream.as_ref()).run(&mut ctx, req),
        )
        .catch_unwind()
        .instrument(span.clone())
        .await;

        let mut response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => err.into_problem_response(ctx.path(), ctx.correlation_id()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                span.in_scope(|| error!(panic = %message, "Filter chain panicked"));
                GatewayError::Internal(message).into_problem_response(ctx.path(), ctx.correlation_id())
            }
        };
        set_correlation_header(&mut response, ctx.correlation_id());

        let status = response.status();
        let entered = ctx.entered();
        let duration = ctx.elapsed();
        span.in_scope(|| {
            for (index, filter) in self.filters.iter().enumerate().rev() {
                let completion = Completion {
                    status,
                    entered: index < entered,
                    duration,
                };
                let hook = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    filter.on_complete(&ctx, &completion);
                }));
                if let Err(panic) = hook {
                    warn!(
                        filter = filter.name(),
                        panic = %panic_message(panic.as_ref()),
                        "Exit hook panicked"
                    );
                }
            }
        });

        response
    }
}

/// Startup-time assembly of a [`Pipeline`].
pub struct PipelineBuilder {
    filters: Vec<Arc<dyn GatewayFilter>>,
    upstream: Arc<dyn Upstream>,
    routes: Arc<RouteTable>,
    client_ip: ClientIpResolver,
    tracker: TaskTracker,
}

impl PipelineBuilder {
    pub fn filter(mut self, filter: Arc<dyn GatewayFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filters(mut self, filters: impl IntoIterator<Item = Arc<dyn GatewayFilter>>) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn client_ip(mut self, resolver: ClientIpResolver) -> Self {
        self.client_ip = resolver;
        self
    }

    /// Track request tasks on `tracker` so shutdown can wait for them.
    pub fn task_tracker(mut self, tracker: TaskTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn build(mut self) -> Pipeline {
        // Stable: equal orders keep registration order.
        self.filters.sort_by_key(|filter| filter.order());
        Pipeline {
            filters: self.filters,
            upstream: self.upstream,
            routes: self.routes,
            client_ip: self.client_ip,
            tracker: self.tracker,
        }
    }
}

fn set_correlation_header(response: &mut Response<Body>, correlation_id: &str) {
    if response.headers().contains_key(CORRELATION_ID_HEADER) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;

    use axum::body::to_bytes;

    use super::*;
    use crate::routing::RouteDescriptor;

    struct EchoUpstream;

    #[async_trait]
    impl Upstream for EchoUpstream {
        async fn forward(
            &self,
            ctx: &RequestContext,
            _req: Request<Body>,
        ) -> GatewayResult<Response<Body>> {
            Ok(Response::new(Body::from(ctx.upstream_url().unwrap_or_default().to_string())))
        }
    }

    /// Records entry and exit events into a shared log.
    struct Probe {
        name: &'static str,
        order: i32,
        log: Arc<Mutex<Vec<String>>>,
        behaviour: Behaviour,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Continue,
        Reject,
        Fail,
        Panic,
    }

    #[async_trait]
    impl GatewayFilter for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        async fn filter(
            &self,
            ctx: &mut RequestContext,
            req: Request<Body>,
            next: Next<'_>,
        ) -> GatewayResult<Response<Body>> {
            self.log.lock().unwrap().push(format!("enter:{}", self.name));
            match self.behaviour {
                Behaviour::Continue => next.run(ctx, req).await,
                Behaviour::Reject => Ok(Response::builder()
                    .status(StatusCode::IM_A_TEAPOT)
                    .body(Body::empty())
                    .unwrap()),
                Behaviour::Fail => Err(GatewayError::Internal("boom".into())),
                Behaviour::Panic => panic!("filter exploded"),
            }
        }

        fn on_complete(&self, _ctx: &RequestContext, completion: &Completion) {
            self.log.lock().unwrap().push(format!(
                "exit:{}:{}:{}",
                self.name,
                completion.entered,
                completion.status.as_u16()
            ));
        }
    }

    fn routes() -> Arc<RouteTable> {
        Arc::new(RouteTable::with_routes(vec![RouteDescriptor {
            id: "orders".into(),
            path_prefix: "/api/orders".into(),
            upstream: "http://orders.internal".into(),
            auth_required: false,
            allowed_consumers: None,
            rate_limit: None,
        }]))
    }

    fn pipeline(probes: Vec<(&'static str, i32, Behaviour)>) -> (Arc<Pipeline>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = Pipeline::builder(Arc::new(EchoUpstream), routes());
        for (name, order, behaviour) in probes {
            builder = builder.filter(Arc::new(Probe {
                name,
                order,
                log: log.clone(),
                behaviour,
            }));
        }
        (Arc::new(builder.build()), log)
    }

    fn request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_filters_run_in_order_with_stable_ties() {
        let (pipeline, log) = pipeline(vec![
            ("c", 3, Behaviour::Continue),
            ("a", 1, Behaviour::Continue),
            ("b1", 2, Behaviour::Continue),
            ("b2", 2, Behaviour::Continue),
        ]);
        assert_eq!(pipeline.filter_names(), vec!["a", "b1", "b2", "c"]);

        let response = pipeline.handle(request("/api/orders/7?x=1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"http://orders.internal/api/orders/7?x=1");

        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "enter:a",
                "enter:b1",
                "enter:b2",
                "enter:c",
                "exit:c:true:200",
                "exit:b2:true:200",
                "exit:b1:true:200",
                "exit:a:true:200",
            ]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_still_runs_every_exit_hook() {
        let (pipeline, log) = pipeline(vec![
            ("a", 1, Behaviour::Continue),
            ("gate", 2, Behaviour::Reject),
            ("late", 3, Behaviour::Continue),
        ]);

        let response = pipeline.handle(request("/api/orders")).await;
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert!(response.headers().contains_key(CORRELATION_ID_HEADER));

        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "enter:a",
                "enter:gate",
                "exit:late:false:418",
                "exit:gate:true:418",
                "exit:a:true:418",
            ]
        );
    }

    #[tokio::test]
    async fn test_error_is_rendered_as_problem() {
        let (pipeline, log) = pipeline(vec![("bad", 1, Behaviour::Fail)]);

        let response = pipeline.handle(request("/api/orders")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(log.lock().unwrap().last().unwrap(), "exit:bad:true:500");
    }

    #[tokio::test]
    async fn test_panic_becomes_500_and_hooks_run() {
        let (pipeline, log) = pipeline(vec![
            ("outer", 1, Behaviour::Continue),
            ("bomb", 2, Behaviour::Panic),
        ]);

        let response = pipeline.handle(request("/api/orders")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let log = log.lock().unwrap().clone();
        assert!(log.contains(&"exit:bomb:true:500".to_string()));
        assert!(log.contains(&"exit:outer:true:500".to_string()));
    }

    #[tokio::test]
    async fn test_unmatched_path_is_404() {
        let (pipeline, _log) = pipeline(vec![]);
        let response = pipeline.handle(request("/nowhere")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }
}
