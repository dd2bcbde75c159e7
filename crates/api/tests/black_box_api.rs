use std::sync::{
    atomic::{AtomicU16, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode as AxumStatus, routing::post, Router};
use batchrelay_api::app::{build_app, AppServices};
use batchrelay_core::{BackoffPolicy, OwnerId, SystemClock};
use batchrelay_infra::{
    AuthError, BatchDelivery, HttpBatchTransport, LeaseManager, RelayConfig,
    ResilientDeliveryClient, RetryScheduler, SchedulerConfig, TokenProvider,
};
use reqwest::StatusCode;
use serde_json::json;

/// Downstream upload endpoint that answers with a configurable status.
#[derive(Clone)]
struct Downstream {
    status: Arc<AtomicU16>,
    calls: Arc<AtomicUsize>,
}

impl Downstream {
    async fn spawn() -> (Self, String) {
        let downstream = Self {
            status: Arc::new(AtomicU16::new(200)),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route("/upload", post(upload))
            .with_state(downstream.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/upload", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (downstream, url)
    }

    fn respond_with(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn upload(State(downstream): State<Downstream>) -> AxumStatus {
    downstream.calls.fetch_add(1, Ordering::SeqCst);
    AxumStatus::from_u16(downstream.status.load(Ordering::SeqCst)).unwrap()
}

struct StaticToken;

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, AuthError> {
        Ok("test-token".to_string())
    }
}

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    delivery: Arc<dyn BatchDelivery>,
    downstream: Downstream,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let (downstream, upload_url) = Downstream::spawn().await;
        let delivery: Arc<dyn BatchDelivery> = Arc::new(ResilientDeliveryClient::new(
            HttpBatchTransport::new(reqwest::Client::new(), upload_url),
            StaticToken,
            RelayConfig::default().pipeline(),
        ));
        let services = Arc::new(AppServices::in_memory(delivery.clone(), backoff(), 3));

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            delivery,
            downstream,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn scheduler(&self) -> RetryScheduler<Arc<dyn batchrelay_infra::QueueStore>, Arc<dyn BatchDelivery>> {
        RetryScheduler::new(
            LeaseManager::new(
                self.services.store().clone(),
                OwnerId::for_host("test"),
                Duration::from_secs(300),
            ),
            self.delivery.clone(),
            backoff(),
            SchedulerConfig::default(),
            self.services.shutdown().clone(),
            Arc::new(SystemClock),
        )
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(10)).unwrap()
}

fn batch(id: &str) -> serde_json::Value {
    json!({
        "batchId": id,
        "requestId": format!("req-{id}"),
        "timestamp": "2026-10-18T09:00:00Z",
        "sourceFileName": "orders.csv",
        "records": [{"sku": "A-1", "qty": 3}],
    })
}

#[tokio::test]
async fn health_reports_drain_state() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, json!({"status": "ok", "inFlight": 0, "shuttingDown": false}));
}

#[tokio::test]
async fn delivered_batch_then_duplicate() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.post(srv.url("/batches")).json(&batch("b-1")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, json!({"outcome": "delivered"}));

    let res = client.post(srv.url("/batches")).json(&batch("b-1")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, json!({"outcome": "duplicate"}));

    assert_eq!(srv.downstream.calls(), 1);
}

#[tokio::test]
async fn failed_first_attempt_is_enqueued_and_queryable() {
    let srv = TestServer::spawn().await;
    srv.downstream.respond_with(503);
    let client = reqwest::Client::new();

    let res = client.post(srv.url("/batches")).json(&batch("b-2")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["outcome"], "enqueued");
    assert_eq!(body["errorCode"], "503");
    let id = body["recordId"].as_i64().unwrap();

    let res = client.get(srv.url(&format!("/deliveries/{id}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let record: serde_json::Value = res.json().await.unwrap();
    assert_eq!(record["batchId"], "b-2");
    assert_eq!(record["status"], "PENDING");
    assert_eq!(record["retryCount"], 0);
    assert_eq!(record["maxRetries"], 3);
    assert_eq!(record["fileName"], "orders.csv");

    let res = client.get(srv.url("/deliveries?status=pending")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let records: Vec<serde_json::Value> = res.json().await.unwrap();
    assert_eq!(records.len(), 1);

    let stats: serde_json::Value = client
        .get(srv.url("/deliveries/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["pending"], 1);
    assert_eq!(stats["failed"], 0);
}

#[tokio::test]
async fn permanent_failures_are_listed_by_default() {
    let srv = TestServer::spawn().await;
    srv.downstream.respond_with(400);
    let client = reqwest::Client::new();

    let res = client.post(srv.url("/batches")).json(&batch("b-3")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = srv.scheduler().run_once().await;
    assert_eq!(report.failed, 1);

    let res = client.get(srv.url("/deliveries")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let records: Vec<serde_json::Value> = res.json().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["batchId"], "b-3");
    assert_eq!(records[0]["status"], "FAILED");
    assert_eq!(records[0]["errorCode"], "400");
    assert_eq!(records[0]["retryCount"], 1);
    assert_eq!(srv.downstream.calls(), 2);
}

#[tokio::test]
async fn bad_requests_use_the_json_error_shape() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/deliveries?status=BOGUS")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_status");

    let res = client.get(srv.url("/deliveries/999")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = client.get(srv.url("/deliveries/abc")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(srv.url("/batches"))
        .json(&json!({"batchId": "b-4"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_payload");
    assert_eq!(srv.downstream.calls(), 0);
}

#[tokio::test]
async fn new_batches_are_refused_once_shutdown_starts() {
    let srv = TestServer::spawn().await;
    srv.services.shutdown().signal_shutdown();
    let client = reqwest::Client::new();

    let res = client.post(srv.url("/batches")).json(&batch("b-5")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "shutting_down");

    let health: serde_json::Value = reqwest::get(srv.url("/health")).await.unwrap().json().await.unwrap();
    assert_eq!(health["shuttingDown"], true);
    assert_eq!(srv.downstream.calls(), 0);
}
