//! End-to-end admission behaviour through the HTTP middleware.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use futures::future::join_all;
use tokio_test::assert_ok;
use tower::ServiceExt;

use turnstile::clock::{Clock, ManualClock};
use turnstile::http::{build_router, RateLimitState, REJECTION_MESSAGE};
use turnstile::metrics::Metrics;
use turnstile::ratelimit::{
    AdmissionGate, CallerIdentity, FailurePolicy, FixedWindow, Verdict, DEFAULT_KEY_PREFIX,
};
use turnstile::store::{CounterStore, MemoryStore, StoreError};

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    gate: Arc<AdmissionGate>,
    downstream_calls: Arc<AtomicUsize>,
    app: Router,
}

impl Harness {
    fn new(limit: u64, window_secs: u64) -> Self {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let gate = AdmissionGate::new(
            store.clone(),
            limit,
            FixedWindow::from_secs(window_secs).unwrap(),
        )
        .unwrap()
        .with_clock(clock.clone());
        Self::with_gate(clock, store, gate)
    }

    fn with_gate(clock: Arc<ManualClock>, store: Arc<MemoryStore>, gate: AdmissionGate) -> Self {
        let gate = Arc::new(gate);
        let downstream_calls = Arc::new(AtomicUsize::new(0));
        let app = build_router(
            downstream_api(downstream_calls.clone()),
            RateLimitState::new(gate.clone()),
            gate.metrics().clone(),
        );
        Self {
            clock,
            store,
            gate,
            downstream_calls,
            app,
        }
    }

    async fn send(&self, peer: &str) -> StatusCode {
        self.app
            .clone()
            .oneshot(request_from(peer, "/api/transactions/user_1"))
            .await
            .unwrap()
            .status()
    }

    fn count_for(&self, identity: &str) -> Option<u64> {
        let key = self
            .gate
            .window()
            .key(&CallerIdentity::new(identity), self.clock.now())
            .to_store_key(DEFAULT_KEY_PREFIX);
        self.store.count(&key)
    }
}

/// Stand-in for the transaction API behind the gate.
fn downstream_api(calls: Arc<AtomicUsize>) -> Router {
    let list_calls = calls.clone();
    Router::new()
        .route(
            "/api/transactions/{user_id}",
            get(move || {
                let calls = list_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    "[]"
                }
            }),
        )
        .route(
            "/api/transactions",
            post(move |body: String| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    body
                }
            }),
        )
}

fn request_from(peer: &str, uri: &str) -> Request<Body> {
    let mut request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let addr: SocketAddr = format!("{peer}:40000").parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

/// Store that is always unreachable.
struct DownStore;

#[async_trait]
impl CounterStore for DownStore {
    async fn increment(&self, _key: &str) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection not established".into()))
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection not established".into()))
    }

    fn backend_name(&self) -> &'static str {
        "down"
    }
}

/// Store that answers with garbage.
struct CorruptStore;

#[async_trait]
impl CounterStore for CorruptStore {
    async fn increment(&self, _key: &str) -> Result<u64, StoreError> {
        Err(StoreError::Unexpected(
            "WRONGTYPE Operation against a key holding the wrong kind of value".into(),
        ))
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn backend_name(&self) -> &'static str {
        "corrupt"
    }
}

fn gated_app(store: Arc<dyn CounterStore>, policy: FailurePolicy, calls: Arc<AtomicUsize>) -> Router {
    let metrics = Arc::new(Metrics::new());
    let gate = AdmissionGate::new(store, 3, FixedWindow::from_secs(60).unwrap())
        .unwrap()
        .with_failure_policy(policy)
        .with_metrics(metrics.clone());
    build_router(
        downstream_api(calls),
        RateLimitState::new(Arc::new(gate)),
        metrics,
    )
}

#[tokio::test]
async fn test_four_rapid_requests_then_new_window() {
    let harness = Harness::new(3, 60);

    let mut statuses = Vec::new();
    for _ in 0..4 {
        statuses.push(harness.send("1.2.3.4").await);
    }
    assert_eq!(
        statuses,
        vec![
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );
    assert_eq!(harness.downstream_calls.load(Ordering::SeqCst), 3);

    harness.clock.advance(Duration::from_secs(61));
    assert_eq!(harness.send("1.2.3.4").await, StatusCode::OK);
    assert_eq!(harness.count_for("1.2.3.4"), Some(1));
}

#[tokio::test]
async fn test_requests_up_to_limit_all_allowed() {
    for limit in 1..=10 {
        let harness = Harness::new(limit, 60);
        for i in 1..=limit {
            let decision = assert_ok!(harness.gate.admit(&CallerIdentity::new("10.1.1.1")).await);
            assert_eq!(decision.verdict, Verdict::Allow, "request {i} of limit {limit}");
        }
        let decision = assert_ok!(harness.gate.admit(&CallerIdentity::new("10.1.1.1")).await);
        assert_eq!(decision.verdict, Verdict::Reject, "request {} of limit {limit}", limit + 1);
    }
}

#[tokio::test]
async fn test_identities_do_not_share_quota() {
    let harness = Harness::new(1, 60);

    let a = assert_ok!(harness.gate.admit(&CallerIdentity::new("A")).await);
    let b = assert_ok!(harness.gate.admit(&CallerIdentity::new("B")).await);
    assert_eq!(a.verdict, Verdict::Allow);
    assert_eq!(b.verdict, Verdict::Allow);

    assert_eq!(harness.send("192.0.2.1").await, StatusCode::OK);
    assert_eq!(harness.send("192.0.2.2").await, StatusCode::OK);
    assert_eq!(harness.send("192.0.2.1").await, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_saturation_does_not_outlive_window() {
    let harness = Harness::new(2, 60);

    for _ in 0..10 {
        harness.send("1.2.3.4").await;
    }
    assert_eq!(harness.send("1.2.3.4").await, StatusCode::TOO_MANY_REQUESTS);

    harness.clock.advance(Duration::from_secs(60));
    assert_eq!(harness.send("1.2.3.4").await, StatusCode::OK);
    assert_eq!(harness.send("1.2.3.4").await, StatusCode::OK);
    assert_eq!(harness.send("1.2.3.4").await, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_rejected_requests_count_once() {
    let harness = Harness::new(3, 60);

    for _ in 0..6 {
        harness.send("1.2.3.4").await;
    }
    // One increment per request, including the rejected ones
    assert_eq!(harness.count_for("1.2.3.4"), Some(6));
    assert_eq!(harness.downstream_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_rejection_body_and_headers() {
    let harness = Harness::new(1, 60);
    harness.send("1.2.3.4").await;

    let response = harness
        .app
        .clone()
        .oneshot(request_from("1.2.3.4", "/api/transactions/user_1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    // 1_700_000_000 sits 20s into its 60s window
    assert_eq!(response.headers()["retry-after"], "40");

    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, serde_json::json!({ "message": REJECTION_MESSAGE }));
}

#[tokio::test]
async fn test_allowed_request_reaches_handler_unchanged() {
    let harness = Harness::new(5, 60);

    let mut request = Request::builder()
        .method("POST")
        .uri("/api/transactions")
        .body(Body::from(r#"{"title":"Coffee","amount":-4.5}"#))
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo::<SocketAddr>("1.2.3.4:40000".parse().unwrap()));

    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], br#"{"title":"Coffee","amount":-4.5}"#);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_requests_lose_no_updates() {
    let limit = 25;
    let total = 100;
    let harness = Arc::new(Harness::new(limit, 60));

    let tasks = (0..total).map(|_| {
        let harness = harness.clone();
        tokio::spawn(async move { harness.send("1.2.3.4").await })
    });
    let statuses: Vec<StatusCode> = join_all(tasks)
        .await
        .into_iter()
        .map(|status| status.unwrap())
        .collect();

    let allowed = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    assert_eq!(allowed as u64, limit);
    assert_eq!(statuses.len() - allowed, (total - limit) as usize);
    assert_eq!(harness.count_for("1.2.3.4"), Some(total));
}

#[tokio::test]
async fn test_fail_open_admits_everything() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = gated_app(Arc::new(DownStore), FailurePolicy::FailOpen, calls.clone());

    for _ in 0..10 {
        let response = app
            .clone()
            .oneshot(request_from("1.2.3.4", "/api/transactions/user_1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_fail_closed_rejects_everything() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = gated_app(Arc::new(DownStore), FailurePolicy::FailClosed, calls.clone());

    for _ in 0..10 {
        let response = app
            .clone()
            .oneshot(request_from("1.2.3.4", "/api/transactions/user_1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unexpected_store_error_fails_request() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = gated_app(Arc::new(CorruptStore), FailurePolicy::FailOpen, calls.clone());

    let response = app
        .oneshot(request_from("1.2.3.4", "/api/transactions/user_1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["message"], "Internal server error");
}

#[tokio::test]
async fn test_health_is_gated() {
    let harness = Harness::new(1, 60);

    let ok = harness
        .app
        .clone()
        .oneshot(request_from("1.2.3.4", "/api/health"))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let limited = harness
        .app
        .clone()
        .oneshot(request_from("1.2.3.4", "/api/health"))
        .await
        .unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
}
