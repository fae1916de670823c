//! End-to-end tests for the gateway proxy pipeline

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tower::ServiceExt;

use lattice_mesh::catalog::memory::MemoryCatalog;
use lattice_mesh::catalog::{HealthStatus, ServiceInstance};
use lattice_mesh::config::{ResilienceConfig, RoutingConfig};
use lattice_mesh::gateway::proxy::{proxy_handler, Proxy};
use lattice_mesh::gateway::routes::RouteTable;

async fn spawn_backend(app: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn healthy_instance(service_name: &str, service_id: &str, port: u16) -> ServiceInstance {
    ServiceInstance {
        service_name: service_name.to_string(),
        service_id: service_id.to_string(),
        address: "127.0.0.1".to_string(),
        port,
        status: HealthStatus::Healthy,
        metadata: HashMap::new(),
        registered_at: None,
        last_health_check: None,
    }
}

fn fast_retries(retry_count: u32) -> ResilienceConfig {
    ResilienceConfig {
        retry_count,
        retry_base_delay_ms: 1,
        retry_backoff_exponent: 1.0,
        retry_jitter_max_ms: 0,
        breaker_failure_threshold: 10,
        breaker_break_duration_secs: 60,
    }
}

async fn proxy_app(catalog: Arc<MemoryCatalog>, resilience: ResilienceConfig) -> Router {
    let routes = Arc::new(RouteTable::new(catalog, RoutingConfig::default()));
    routes.refresh().await;
    let proxy = Arc::new(Proxy::new(routes, resilience).unwrap());
    Router::new().fallback(proxy_handler).with_state(proxy)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_routes_to_backend_and_strips_prefix() {
    // The backend only serves /hello; anything else proves path mangling.
    let port = spawn_backend(Router::new().route("/hello", get(|| async { "OK from backend" }))).await;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.upsert(healthy_instance("my-service", "svc-1", port));
    let app = proxy_app(catalog, fast_retries(0)).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/my-service/hello")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "OK from backend");
}

#[tokio::test]
async fn test_preserves_query_string() {
    async fn echo(Query(params): Query<HashMap<String, String>>) -> String {
        format!("{}-{}", params["a"], params["b"])
    }
    let port = spawn_backend(Router::new().route("/echo", get(echo))).await;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.upsert(healthy_instance("my-service", "svc-1", port));
    let app = proxy_app(catalog, fast_retries(0)).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/my-service/echo?a=1&b=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "1-2");
}

#[tokio::test]
async fn test_unknown_service_returns_502() {
    let catalog = Arc::new(MemoryCatalog::new());
    let app = proxy_app(catalog, fast_retries(0)).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/unknown/x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(body_string(response).await.contains("service not found: unknown"));
}

#[tokio::test]
async fn test_path_outside_prefix_returns_404() {
    let catalog = Arc::new(MemoryCatalog::new());
    let app = proxy_app(catalog, fast_retries(0)).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/other/path")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_retries_transient_503_until_success() {
    async fn flaky(State(calls): State<Arc<AtomicUsize>>) -> impl IntoResponse {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= 2 {
            (StatusCode::SERVICE_UNAVAILABLE, "not yet").into_response()
        } else {
            (StatusCode::OK, "recovered").into_response()
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let backend = Router::new()
        .route("/work", get(flaky))
        .with_state(calls.clone());
    let port = spawn_backend(backend).await;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.upsert(healthy_instance("my-service", "svc-1", port));
    let app = proxy_app(catalog, fast_retries(3)).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/my-service/work")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_exhaustion_forwards_last_5xx_response() {
    async fn always_down(State(calls): State<Arc<AtomicUsize>>) -> impl IntoResponse {
        calls.fetch_add(1, Ordering::SeqCst);
        (StatusCode::SERVICE_UNAVAILABLE, "upstream says no")
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let backend = Router::new()
        .route("/work", get(always_down))
        .with_state(calls.clone());
    let port = spawn_backend(backend).await;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.upsert(healthy_instance("my-service", "svc-1", port));
    let app = proxy_app(catalog, fast_retries(2)).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/my-service/work")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_string(response).await, "upstream says no");
    // 1 initial attempt + 2 retries.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_open_breaker_returns_503_without_calling_backend() {
    let catalog = Arc::new(MemoryCatalog::new());
    // Nothing listens on port 1, so every forward is a transport error.
    catalog.upsert(healthy_instance("my-service", "svc-1", 1));

    let resilience = ResilienceConfig {
        retry_count: 0,
        retry_base_delay_ms: 1,
        retry_backoff_exponent: 1.0,
        retry_jitter_max_ms: 0,
        breaker_failure_threshold: 1,
        breaker_break_duration_secs: 60,
    };
    let app = proxy_app(catalog, resilience).await;

    // First request trips the breaker via a transport failure.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/my-service/x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // Second request is refused by the open breaker.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/my-service/x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_forwards_request_body_and_headers() {
    async fn inspect(req: Request<Body>) -> String {
        let header = req
            .headers()
            .get("x-tenant")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap();
        format!("{}:{}", header, String::from_utf8_lossy(&body))
    }
    let backend = Router::new().route("/submit", axum::routing::post(inspect));
    let port = spawn_backend(backend).await;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.upsert(healthy_instance("my-service", "svc-1", port));
    let app = proxy_app(catalog, fast_retries(0)).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/my-service/submit")
                .header("x-tenant", "acme")
                .body(Body::from("payload"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "acme:payload");
}
