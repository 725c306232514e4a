//! HTTP-level tests: the SSE inference endpoint, admission control, and the
//! forward-proxy fallback, all against in-process collaborators.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use tokio::sync::Semaphore;
use tower::ServiceExt;

use inference_gateway::dispatch::{PriorityQueue, WorkerRouter};
use inference_gateway::limit::MemoryRateLimiter;
use inference_gateway::test_util::mock_worker::MockWorker;
use inference_gateway::{app, AppState, Blocklist, Config};

struct TestGateway {
    app: axum::Router,
    queue: Arc<PriorityQueue>,
    router: Arc<WorkerRouter>,
}

async fn gateway_with_workers(addresses: Vec<String>) -> TestGateway {
    let queue = Arc::new(PriorityQueue::new());
    let router = Arc::new(
        WorkerRouter::new(&addresses, Arc::clone(&queue), Duration::from_secs(300))
            .expect("router construction"),
    );
    router.start().await;

    let state = Arc::new(AppState {
        config: Config::default(),
        queue: Some(Arc::clone(&queue)),
        limiter: Arc::new(MemoryRateLimiter::new(600_000, 10_000)),
        blocklist: Arc::new(Blocklist::default()),
        http_client: reqwest::Client::new(),
    });

    TestGateway {
        app: app(state),
        queue,
        router,
    }
}

fn gateway_without_workers(blocklist: Blocklist, limiter: MemoryRateLimiter) -> axum::Router {
    let state = Arc::new(AppState {
        config: Config::default(),
        queue: None,
        limiter: Arc::new(limiter),
        blocklist: Arc::new(blocklist),
        http_client: reqwest::Client::new(),
    });
    app(state)
}

fn inference_request(body: &str, request_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/v1/inference")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(id) = request_id {
        builder = builder.header("x-request-id", id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_inference_streams_tokens_as_sse() {
    let mock = MockWorker::new("default-model");
    let (addr, _server) = mock.clone().spawn().await;
    let gw = gateway_with_workers(vec![addr]).await;

    let response = gw
        .app
        .clone()
        .oneshot(inference_request(
            r#"{"prompt": "hello world from tests"}"#,
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap(),
        "text/event-stream"
    );
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache"
    );

    let body = body_text(response).await;
    let data_frames: Vec<&str> = body
        .lines()
        .filter(|line| line.starts_with("data: "))
        .collect();

    // Four word frames plus the terminal frame.
    assert_eq!(data_frames.len(), 5);
    assert!(data_frames[0].contains("hello"));
    assert!(body.contains(r#""finished":true"#));
    // Every data line is followed by exactly one blank line.
    assert_eq!(body.matches("\n\n").count(), data_frames.len());
}

#[tokio::test]
async fn test_invalid_json_is_rejected() {
    let mock = MockWorker::new("default-model");
    let (addr, _server) = mock.spawn().await;
    let gw = gateway_with_workers(vec![addr]).await;

    let response = gw
        .app
        .clone()
        .oneshot(inference_request("{not json", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_empty_prompt_is_rejected() {
    let mock = MockWorker::new("default-model");
    let (addr, _server) = mock.spawn().await;
    let gw = gateway_with_workers(vec![addr]).await;

    for body in [r#"{"prompt": ""}"#, r#"{}"#] {
        let response = gw
            .app
            .clone()
            .oneshot(inference_request(body, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn test_submission_after_close_returns_503() {
    let mock = MockWorker::new("default-model");
    let (addr, _server) = mock.spawn().await;
    let gw = gateway_with_workers(vec![addr]).await;

    tokio::time::timeout(Duration::from_secs(5), gw.router.close())
        .await
        .expect("close did not finish");
    assert!(gw.queue.is_closed().await);

    let response = gw
        .app
        .clone()
        .oneshot(inference_request(r#"{"prompt": "late"}"#, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_backend_error_surfaces_as_sse_error_event() {
    let mock = MockWorker::new("default-model").with_fail_after(2);
    let (addr, _server) = mock.spawn().await;
    let gw = gateway_with_workers(vec![addr]).await;

    let response = gw
        .app
        .clone()
        .oneshot(inference_request(
            r#"{"prompt": "one two three four five"}"#,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_text(response).await;
    let data_frames = body
        .lines()
        .filter(|line| line.starts_with("data: ") && line.contains("token_count"))
        .count();
    assert_eq!(data_frames, 2);
    assert!(body.contains("event: error"));
    assert!(body.contains("mock backend failure"));
}

#[tokio::test]
async fn test_priority_dispatch_order_with_single_busy_worker() {
    let gate = Arc::new(Semaphore::new(0));
    let mock = MockWorker::new("default-model").with_gate(Arc::clone(&gate));
    let (addr, _server) = mock.clone().spawn().await;
    let gw = gateway_with_workers(vec![addr]).await;

    // Occupy the single worker.
    let response = gw
        .app
        .clone()
        .oneshot(inference_request(
            r#"{"prompt": "blocker", "priority": 1}"#,
            Some("blocker"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mock_for_wait = mock.clone();
    wait_until(move || mock_for_wait.received_ids().len() == 1).await;

    // Queue three more while the worker is held.
    for (id, priority) in [("low", 1), ("high", 10), ("medium", 5)] {
        let body = format!(r#"{{"prompt": "next please", "priority": {}}}"#, priority);
        let response = gw
            .app
            .clone()
            .oneshot(inference_request(&body, Some(id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    gate.add_permits(4);
    let mock_for_wait = mock.clone();
    wait_until(move || mock_for_wait.received_ids().len() == 4).await;

    assert_eq!(
        mock.received_ids(),
        vec!["blocker", "high", "medium", "low"]
    );
}

#[tokio::test]
async fn test_request_id_is_echoed_and_propagated_to_worker() {
    let mock = MockWorker::new("default-model");
    let (addr, _server) = mock.clone().spawn().await;
    let gw = gateway_with_workers(vec![addr]).await;

    let response = gw
        .app
        .clone()
        .oneshot(inference_request(
            r#"{"prompt": "hello"}"#,
            Some("my-id-123"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-request-id").unwrap(), "my-id-123");

    let mock_for_wait = mock.clone();
    wait_until(move || mock_for_wait.received_ids().contains(&"my-id-123".to_string())).await;
}

#[tokio::test]
async fn test_request_id_is_minted_when_absent() {
    let mock = MockWorker::new("default-model");
    let (addr, _server) = mock.spawn().await;
    let gw = gateway_with_workers(vec![addr]).await;

    let response = gw
        .app
        .clone()
        .oneshot(inference_request(r#"{"prompt": "hello"}"#, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-request-id").is_some());
}

#[tokio::test]
async fn test_inference_disabled_without_workers() {
    let app = gateway_without_workers(Blocklist::default(), MemoryRateLimiter::new(600_000, 100));

    let response = app
        .oneshot(inference_request(r#"{"prompt": "hello"}"#, None))
        .await
        .unwrap();
    // No inference route mounted; the relative URI falls through the proxy.
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = gateway_without_workers(Blocklist::default(), MemoryRateLimiter::new(600_000, 100));

    let request = Request::builder()
        .method(Method::GET)
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.contains("ok"));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = gateway_without_workers(Blocklist::default(), MemoryRateLimiter::new(600_000, 100));

    let request = Request::builder()
        .method(Method::GET)
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_blocked_domain_returns_403() {
    let blocklist = Blocklist::from_domains(vec!["ads.example.com".to_string()]);
    let app = gateway_without_workers(blocklist, MemoryRateLimiter::new(600_000, 100));

    let request = Request::builder()
        .method(Method::GET)
        .uri("http://ads.example.com/banner.png")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_text(response).await;
    assert!(body.contains("Domain Blocked"));
}

#[tokio::test]
async fn test_connect_is_not_implemented() {
    let app = gateway_without_workers(Blocklist::default(), MemoryRateLimiter::new(600_000, 100));

    let request = Request::builder()
        .method(Method::CONNECT)
        .uri("http://example.com/")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_forward_proxy_relays_to_origin() {
    // A tiny origin server to proxy to.
    let origin = axum::Router::new().route(
        "/hello",
        axum::routing::get(|| async { "hi from origin" }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, origin).await.unwrap();
    });

    let app = gateway_without_workers(Blocklist::default(), MemoryRateLimiter::new(600_000, 100));

    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{}/hello", origin_addr))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert_eq!(body, "hi from origin");
}

#[tokio::test]
async fn test_rate_limit_rejects_after_burst() {
    let app = gateway_without_workers(Blocklist::default(), MemoryRateLimiter::new(1, 1));

    let first = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}
