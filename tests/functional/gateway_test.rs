//! End-to-end tests for the assembled gateway middleware stack

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    routing::get,
    Router,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::json;
use tower::ServiceExt;

use lattice_mesh::catalog::memory::MemoryCatalog;
use lattice_mesh::catalog::{HealthStatus, ServiceInstance};
use lattice_mesh::config::GatewaySettings;
use lattice_mesh::gateway::{build_router, proxy::Proxy, routes::RouteTable};

fn make_token(secret: &str, claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    let signing_input = format!("{}.{}", header, payload);

    let mut mac = Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{}.{}", signing_input, signature)
}

async fn gateway_app(catalog: Arc<MemoryCatalog>, settings: &GatewaySettings) -> Router {
    let routes = Arc::new(RouteTable::new(catalog, settings.routing.clone()));
    routes.refresh().await;
    let proxy = Arc::new(Proxy::new(routes, settings.resilience.clone()).unwrap());
    build_router(proxy, settings)
}

fn secured_settings() -> GatewaySettings {
    let mut settings = GatewaySettings::default();
    settings.jwt.secret_key = "sekret".to_string();
    settings.jwt.issuer = "issuer-1".to_string();
    settings.jwt.audience = "audience-1".to_string();
    settings.rate_limit.permit_limit = 2;
    settings
}

fn request(uri: &str, peer: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .extension(ConnectInfo(peer.parse::<SocketAddr>().unwrap()))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_bypasses_auth_and_rate_limit() {
    let settings = secured_settings();
    let app = gateway_app(Arc::new(MemoryCatalog::new()), &settings).await;

    // Far more requests than the permit limit, all unauthenticated.
    for _ in 0..10 {
        let response = app
            .clone()
            .oneshot(request("/health", "10.0.0.1:1000"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({"status": "Healthy"}));
    }
}

#[tokio::test]
async fn test_proxied_path_requires_token() {
    let settings = secured_settings();
    let app = gateway_app(Arc::new(MemoryCatalog::new()), &settings).await;

    let response = app
        .clone()
        .oneshot(request("/api/orders/list", "10.0.0.1:1000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // With a valid token the request reaches the proxy, which has no route.
    let token = make_token(
        "sekret",
        &json!({
            "exp": Utc::now().timestamp() + 3600,
            "iss": "issuer-1",
            "aud": "audience-1",
        }),
    );
    let req = Request::builder()
        .uri("/api/orders/list")
        .header("authorization", format!("Bearer {}", token))
        .extension(ConnectInfo("10.0.0.1:1000".parse::<SocketAddr>().unwrap()))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_rate_limit_applies_to_proxied_paths() {
    let mut settings = GatewaySettings::default();
    settings.rate_limit.permit_limit = 1;
    let app = gateway_app(Arc::new(MemoryCatalog::new()), &settings).await;

    let response = app
        .clone()
        .oneshot(request("/api/orders/list", "10.0.0.1:1000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let response = app
        .oneshot(request("/api/orders/list", "10.0.0.1:1000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_preflight_short_circuits_with_cors_headers() {
    let settings = secured_settings();
    let app = gateway_app(Arc::new(MemoryCatalog::new()), &settings).await;

    // No token, OPTIONS still terminates with 204 at the CORS layer.
    let req = Request::builder()
        .method("OPTIONS")
        .uri("/api/orders/list")
        .header("origin", "https://example.com")
        .extension(ConnectInfo("10.0.0.1:1000".parse::<SocketAddr>().unwrap()))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_proxies_to_healthy_backend_through_full_stack() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let backend = Router::new().route("/ping", get(|| async { "pong" }));
        axum::serve(listener, backend).await.unwrap();
    });

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.upsert(ServiceInstance {
        service_name: "echo".to_string(),
        service_id: "echo-1".to_string(),
        address: "127.0.0.1".to_string(),
        port,
        status: HealthStatus::Healthy,
        metadata: HashMap::new(),
        registered_at: None,
        last_health_check: None,
    });

    let settings = GatewaySettings::default();
    let app = gateway_app(catalog, &settings).await;

    let response = app
        .oneshot(request("/api/echo/ping", "10.0.0.1:1000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"pong");
}
