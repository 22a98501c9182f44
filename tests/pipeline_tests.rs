//! End-to-end tests of the filter chain through the axum router.
//!
//! The upstream is an in-process stub, tokens are HS256 and minted locally,
//! and token buckets run on a manual clock, so no network or timing
//! assumptions are involved.
//!
//! Run with: `cargo test --test pipeline_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_gateway::filters::{
    AccessLogFilter, AccessLogRecord, AccessLogSink, CorrelationFilter, MetricsFilter,
};
use api_gateway::filters::access_log::AccessLogError;
use api_gateway::jwt::{JwtVerifier, StaticKeySource, VerifierSettings};
use api_gateway::rate_limiter::{
    BucketKey, Clock, LocalTokenBucketStore, ManualClock, RateLimitResult, RateLimitStore,
    RateLimiter, RateLimiterConfig, StoreError,
};
use api_gateway::routing::{RateLimitPolicy, RouteDescriptor, RouteTable};
use api_gateway::state::GatewayParts;
use api_gateway::upstream::Upstream;
use api_gateway::{AppState, Config, GatewayResult, Pipeline, RequestContext, build_router};
use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, Request, Response, StatusCode};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio_util::task::TaskTracker;
use tower::ServiceExt;

const SECRET: &[u8] = b"pipeline-test-secret-0123456789abcdef";
const T0: u64 = 1_700_000_000_000;
const CLIENT_IP: &str = "203.0.113.5";

// =============================================================================
// Fixtures
// =============================================================================

/// Upstream stub answering 200 and remembering what it was sent.
#[derive(Default)]
struct StubUpstream {
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, HeaderMap)>>,
}

#[async_trait]
impl Upstream for StubUpstream {
    async fn forward(
        &self,
        ctx: &RequestContext,
        req: Request<Body>,
    ) -> GatewayResult<Response<Body>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push((
            ctx.consumer_id_or_anonymous().to_string(),
            req.headers().clone(),
        ));
        Ok(Response::new(Body::from(
            ctx.upstream_url().unwrap_or_default().to_string(),
        )))
    }
}

#[derive(Default)]
struct MemorySink(Mutex<Vec<AccessLogRecord>>);

impl AccessLogSink for MemorySink {
    fn emit(&self, record: &AccessLogRecord) -> Result<(), AccessLogError> {
        self.0.lock().unwrap().push(record.clone());
        Ok(())
    }
}

impl MemorySink {
    fn records(&self) -> Vec<AccessLogRecord> {
        self.0.lock().unwrap().clone()
    }
}

/// Store that is always down.
struct DownStore;

#[async_trait]
impl RateLimitStore for DownStore {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn check_and_consume(
        &self,
        _key: &BucketKey,
        _policy: &RateLimitPolicy,
    ) -> Result<RateLimitResult, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

/// Shared in-memory store standing in for Redis across gateway instances.
struct SharedStore(LocalTokenBucketStore);

#[async_trait]
impl RateLimitStore for SharedStore {
    fn name(&self) -> &'static str {
        "shared-memory"
    }

    async fn check_and_consume(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitResult, StoreError> {
        Ok(self.0.decide(key, policy))
    }
}

fn routes() -> Arc<RouteTable> {
    Arc::new(RouteTable::with_routes(vec![
        RouteDescriptor {
            id: "orders".into(),
            path_prefix: "/api/orders".into(),
            upstream: "http://orders.internal".into(),
            auth_required: true,
            allowed_consumers: Some(vec!["partner-a".into()]),
            rate_limit: Some(RateLimitPolicy::new(5, 5)),
        },
        RouteDescriptor {
            id: "catalog".into(),
            path_prefix: "/public".into(),
            upstream: "http://catalog.internal".into(),
            auth_required: false,
            allowed_consumers: None,
            rate_limit: None,
        },
    ]))
}

struct Gateway {
    app: Router,
    state: AppState,
    upstream: Arc<StubUpstream>,
    sink: Arc<MemorySink>,
}

impl Gateway {
    fn with_limiter(limiter: RateLimiter) -> Self {
        let upstream = Arc::new(StubUpstream::default());
        let sink = Arc::new(MemorySink::default());
        let parts = GatewayParts {
            routes: routes(),
            rate_limiter: Arc::new(limiter),
            verifier: Arc::new(JwtVerifier::new(
                Arc::new(StaticKeySource::from_secret(SECRET)),
                VerifierSettings::default(),
            )),
            upstream: upstream.clone(),
            access_log: sink.clone(),
        };
        let state = AppState::new(Config::default(), parts);
        Self {
            app: build_router(state.clone()),
            state,
            upstream,
            sink,
        }
    }

    fn local(clock: Arc<ManualClock>) -> Self {
        Self::with_limiter(RateLimiter::local(RateLimiterConfig::default(), clock))
    }

    async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(req).await.unwrap()
    }

    fn upstream_calls(&self) -> usize {
        self.upstream.calls.load(Ordering::SeqCst)
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(T0))
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn token(consumer: &str, exp_offset_secs: i64) -> String {
    let claims = json!({ "azp": consumer, "exp": now_secs() + exp_offset_secs });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET),
    )
    .unwrap()
}

fn orders_request(token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri("/api/orders/42?expand=lines")
        .header("x-forwarded-for", CLIENT_IP);
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn header<'a>(response: &'a Response<Body>, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {name}"))
        .to_str()
        .unwrap()
}

// =============================================================================
// Authentication, Whitelist and Rate Limiting
// =============================================================================

#[tokio::test]
async fn test_orders_scenario_burst_then_429_then_403() {
    let gateway = Gateway::local(clock());
    let partner_a = token("partner-a", 600);

    for expected_remaining in (0..5).rev() {
        let response = gateway.send(orders_request(Some(&partner_a))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), "5");
        assert_eq!(
            header(&response, "x-ratelimit-remaining"),
            expected_remaining.to_string()
        );
        assert!(response.headers().contains_key("x-ratelimit-reset"));
        assert!(!response.headers().contains_key(RETRY_AFTER));
    }

    let response = gateway.send(orders_request(Some(&partner_a))).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = header(&response, RETRY_AFTER.as_str()).parse().unwrap();
    assert!(retry_after >= 1);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "0");
    assert_eq!(header(&response, "x-ratelimit-limit"), "5");
    assert_eq!(
        header(&response, CONTENT_TYPE.as_str()),
        "application/problem+json"
    );
    let correlation_id = header(&response, "x-correlation-id").to_string();
    let body = json_body(response).await;
    assert_eq!(body["type"], "https://api.gateway/errors/rate-limit-exceeded");
    assert_eq!(body["status"], 429);
    assert_eq!(body["instance"], "/api/orders/42");
    assert_eq!(body["correlationId"], correlation_id);

    let partner_b = token("partner-b", 600);
    let response = gateway.send(orders_request(Some(&partner_b))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["type"], "https://api.gateway/errors/forbidden");

    assert_eq!(gateway.upstream_calls(), 5);
}

#[tokio::test]
async fn test_forbidden_consumer_does_not_consume_quota() {
    let gateway = Gateway::local(clock());
    let partner_b = token("partner-b", 600);
    for _ in 0..10 {
        let response = gateway.send(orders_request(Some(&partner_b))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    let response = gateway
        .send(orders_request(Some(&token("partner-a", 600))))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "4");
}

#[tokio::test]
async fn test_one_refill_interval_admits_exactly_one_request() {
    let clock = clock();
    let gateway = Gateway::local(clock.clone());
    let partner_a = token("partner-a", 600);

    for _ in 0..5 {
        gateway.send(orders_request(Some(&partner_a))).await;
    }
    assert_eq!(
        gateway.send(orders_request(Some(&partner_a))).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    // 5 rps refills one token every 200ms.
    clock.advance(Duration::from_millis(200));
    assert_eq!(
        gateway.send(orders_request(Some(&partner_a))).await.status(),
        StatusCode::OK
    );
    assert_eq!(
        gateway.send(orders_request(Some(&partner_a))).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_buckets_are_per_client_address() {
    let gateway = Gateway::local(clock());
    let partner_a = token("partner-a", 600);

    for _ in 0..5 {
        gateway.send(orders_request(Some(&partner_a))).await;
    }

    let other_client = Request::builder()
        .uri("/api/orders")
        .header("x-forwarded-for", "198.51.100.77, 10.0.0.1")
        .header(AUTHORIZATION, format!("Bearer {partner_a}"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(gateway.send(other_client).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_expired_token_is_401_with_bearer_challenge() {
    let gateway = Gateway::local(clock());

    let response = gateway
        .send(orders_request(Some(&token("partner-a", -3600))))
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(header(&response, WWW_AUTHENTICATE.as_str()), "Bearer");
    assert_eq!(
        header(&response, CONTENT_TYPE.as_str()),
        "application/problem+json"
    );
    assert!(!response.headers().contains_key(RETRY_AFTER));
    let body = json_body(response).await;
    assert_eq!(body["status"], 401);
    assert_eq!(body["title"], "Unauthorized");
    assert_eq!(gateway.upstream_calls(), 0);
}

#[tokio::test]
async fn test_missing_and_malformed_credentials_are_401() {
    let gateway = Gateway::local(clock());

    let response = gateway.send(orders_request(None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(header(&response, WWW_AUTHENTICATE.as_str()), "Bearer");

    let basic = Request::builder()
        .uri("/api/orders")
        .header(AUTHORIZATION, "Basic dXNlcjpwYXNz")
        .body(Body::empty())
        .unwrap();
    let response = gateway.send(basic).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(gateway.upstream_calls(), 0);
}

#[tokio::test]
async fn test_public_route_runs_anonymous_or_with_header_identity() {
    let gateway = Gateway::local(clock());

    let response = gateway.send(get("/public/items")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("x-ratelimit-limit"));

    let with_header = Request::builder()
        .uri("/public/items")
        .header("x-consumer-id", "mobile.app_v2")
        .body(Body::empty())
        .unwrap();
    gateway.send(with_header).await;

    let injected = Request::builder()
        .uri("/public/items")
        .header("x-consumer-id", "evil consumer;drop")
        .body(Body::empty())
        .unwrap();
    gateway.send(injected).await;

    let seen: Vec<String> = gateway
        .upstream
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|(consumer, _)| consumer.clone())
        .collect();
    assert_eq!(seen, vec!["anonymous", "mobile.app_v2", "anonymous"]);
}

#[tokio::test]
async fn test_token_identity_beats_consumer_header() {
    let gateway = Gateway::local(clock());
    let mut req = orders_request(Some(&token("partner-a", 600)));
    req.headers_mut()
        .insert("x-consumer-id", "spoofed".parse().unwrap());

    assert_eq!(gateway.send(req).await.status(), StatusCode::OK);
    assert_eq!(gateway.upstream.seen.lock().unwrap()[0].0, "partner-a");
}

#[tokio::test]
async fn test_invalid_token_on_public_route_is_rejected() {
    let gateway = Gateway::local(clock());
    let req = Request::builder()
        .uri("/public/items")
        .header(AUTHORIZATION, "Bearer not.a.token")
        .body(Body::empty())
        .unwrap();

    assert_eq!(gateway.send(req).await.status(), StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Correlation and Access Records
// =============================================================================

#[tokio::test]
async fn test_correlation_id_is_reused_and_forwarded() {
    let gateway = Gateway::local(clock());
    let req = Request::builder()
        .uri("/public/items")
        .header("x-correlation-id", "abc-123")
        .body(Body::empty())
        .unwrap();

    let response = gateway.send(req).await;
    assert_eq!(header(&response, "x-correlation-id"), "abc-123");

    let (_, forwarded) = gateway.upstream.seen.lock().unwrap()[0].clone();
    assert_eq!(forwarded["x-correlation-id"], "abc-123");

    let records = gateway.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].correlation_id, "abc-123");
}

#[tokio::test]
async fn test_correlation_id_generated_on_every_path() {
    let gateway = Gateway::local(clock());

    for response in [
        gateway.send(get("/public/items")).await,
        gateway.send(orders_request(None)).await,
        gateway.send(get("/nowhere")).await,
    ] {
        let id = header(&response, "x-correlation-id");
        assert!(uuid::Uuid::parse_str(id).is_ok(), "not a uuid: {id}");
    }
}

#[tokio::test]
async fn test_one_access_record_per_request_whatever_the_outcome() {
    let gateway = Gateway::local(clock());
    let partner_a = token("partner-a", 600);

    gateway.send(orders_request(Some(&partner_a))).await; // 200
    gateway.send(orders_request(None)).await; // 401
    gateway
        .send(orders_request(Some(&token("partner-b", 600))))
        .await; // 403
    gateway.send(get("/nowhere")).await; // 404

    let records = gateway.sink.records();
    let statuses: Vec<u16> = records.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![200, 401, 403, 404]);

    let ok = &records[0];
    assert_eq!(ok.consumer_id, "partner-a");
    assert_eq!(ok.method, "GET");
    assert_eq!(ok.path, "/api/orders/42");
    assert_eq!(ok.client_ip, CLIENT_IP);
    assert_eq!(
        ok.upstream_url.as_deref(),
        Some("http://orders.internal/api/orders/42?expand=lines")
    );

    assert_eq!(records[1].consumer_id, "anonymous");
    assert!(records[1].upstream_url.is_none());
}

#[tokio::test]
async fn test_unmatched_path_is_404_problem() {
    let gateway = Gateway::local(clock());

    let response = gateway.send(get("/nowhere")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["type"], "https://api.gateway/errors/not-found");
    assert_eq!(body["instance"], "/nowhere");
}

// =============================================================================
// Degraded Mode and Shared State
// =============================================================================

#[tokio::test]
async fn test_store_outage_falls_back_to_local_buckets() {
    let clock = clock();
    let limiter =
        RateLimiter::distributed(Arc::new(DownStore), RateLimiterConfig::default(), clock);
    let gateway = Gateway::with_limiter(limiter);
    let partner_a = token("partner-a", 600);

    for _ in 0..5 {
        let response = gateway.send(orders_request(Some(&partner_a))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), "5");
    }
    assert_eq!(
        gateway.send(orders_request(Some(&partner_a))).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    assert!(gateway.state.rate_limiter.is_degraded());
    let ready = gateway.send(get("/ready")).await;
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

    let health = gateway.send(get("/health")).await;
    assert_eq!(health.status(), StatusCode::OK);
    let body = json_body(health).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["rate_limit_backend"], "fallback");
}

#[tokio::test]
async fn test_instances_share_one_store() {
    let clock = clock();
    let shared: Arc<dyn RateLimitStore> = Arc::new(SharedStore(LocalTokenBucketStore::new(
        api_gateway::rate_limiter::DEFAULT_LOCAL_CAPACITY,
        clock.clone() as Arc<dyn Clock>,
    )));
    let first = Gateway::with_limiter(RateLimiter::distributed(
        shared.clone(),
        RateLimiterConfig::default(),
        clock.clone(),
    ));
    let second = Gateway::with_limiter(RateLimiter::distributed(
        shared,
        RateLimiterConfig::default(),
        clock,
    ));
    let partner_a = token("partner-a", 600);

    let mut allowed = 0;
    for i in 0..10 {
        let gateway = if i % 2 == 0 { &first } else { &second };
        if gateway.send(orders_request(Some(&partner_a))).await.status() == StatusCode::OK {
            allowed += 1;
        }
    }

    assert_eq!(allowed, 5);
    assert!(!first.state.rate_limiter.is_degraded());
}

// =============================================================================
// Ops Endpoints
// =============================================================================

#[tokio::test]
async fn test_ops_endpoints_bypass_the_chain() {
    let gateway = Gateway::local(clock());

    let health = gateway.send(get("/health")).await;
    assert_eq!(health.status(), StatusCode::OK);
    assert!(!health.headers().contains_key("x-correlation-id"));
    let body = json_body(health).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["rate_limit_backend"], "local");
    assert_eq!(body["routes"], 2);
    assert!(body.get("rate_store_breaker").is_none());

    assert_eq!(gateway.send(get("/ready")).await.status(), StatusCode::OK);
    assert!(gateway.sink.records().is_empty());
}

#[tokio::test]
async fn test_shutdown_waits_for_background_tasks() {
    let gateway = Gateway::local(clock());
    gateway.send(get("/public/items")).await;

    tokio::time::timeout(Duration::from_secs(5), gateway.state.shutdown())
        .await
        .unwrap();
}

// =============================================================================
// Client Disconnect
// =============================================================================

/// Upstream that answers after a delay.
struct SlowUpstream(Duration);

#[async_trait]
impl Upstream for SlowUpstream {
    async fn forward(
        &self,
        _ctx: &RequestContext,
        _req: Request<Body>,
    ) -> GatewayResult<Response<Body>> {
        tokio::time::sleep(self.0).await;
        Ok(Response::new(Body::empty()))
    }
}

#[tokio::test]
async fn test_dropped_request_still_runs_exit_hooks() {
    let sink = Arc::new(MemorySink::default());
    let metrics = Arc::new(MetricsFilter::new());
    let tracker = TaskTracker::new();
    let pipeline = Arc::new(
        Pipeline::builder(Arc::new(SlowUpstream(Duration::from_millis(200))), routes())
            .filter(Arc::new(CorrelationFilter))
            .filter(metrics.clone())
            .filter(Arc::new(AccessLogFilter::new(sink.clone())))
            .task_tracker(tracker.clone())
            .build(),
    );

    // The client gives up long before the upstream answers.
    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), pipeline.handle(get("/public/slow"))).await;
    assert!(abandoned.is_err());
    assert_eq!(metrics.in_flight(), 1);
    assert!(sink.records().is_empty());

    tracker.close();
    tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].path, "/public/slow");
    assert_eq!(records[0].status, 200);
    assert_eq!(metrics.in_flight(), 0);
}
