//! Integration tests for the discovery RPC surface

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use lattice_mesh::catalog::memory::MemoryCatalog;
use lattice_mesh::catalog::Catalog;
use lattice_mesh::discovery::{router, DiscoveryService};
use lattice_mesh::messaging::{CollectingPublisher, DomainEvent};

struct Fixture {
    app: Router,
    catalog: Arc<MemoryCatalog>,
    publisher: Arc<CollectingPublisher>,
}

fn fixture() -> Fixture {
    let catalog = Arc::new(MemoryCatalog::new());
    let publisher = Arc::new(CollectingPublisher::new());
    let service = Arc::new(DiscoveryService::new(catalog.clone(), publisher.clone()));
    Fixture {
        app: router(service),
        catalog,
        publisher,
    }
}

fn post_json(uri: &str, body: &Value, peer: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .extension(ConnectInfo(peer.parse::<SocketAddr>().unwrap()))
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_register_and_list_instances() {
    let f = fixture();

    let response = f
        .app
        .clone()
        .oneshot(post_json(
            "/rpc/register",
            &json!({
                "serviceName": "orders",
                "serviceId": "orders-1",
                "address": "192.168.5.1",
                "port": 9000,
                "metadata": {"scheme": "http"},
            }),
            "10.0.0.7:5123",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["serviceId"], "orders-1");

    let response = f
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/rpc/instances/orders")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    let instances = body["instances"].as_array().unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0]["serviceId"], "orders-1");
    assert_eq!(instances[0]["address"], "192.168.5.1");
    assert_eq!(instances[0]["status"], "Healthy");

    let response = f
        .app
        .oneshot(
            Request::builder()
                .uri("/rpc/services")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["serviceNames"], json!(["orders"]));
}

#[tokio::test]
async fn test_register_rewrites_loopback_address_to_peer() {
    let f = fixture();

    let response = f
        .app
        .clone()
        .oneshot(post_json(
            "/rpc/register",
            &json!({
                "serviceName": "orders",
                "serviceId": "orders-1",
                "address": "127.0.0.1",
                "port": 9000,
            }),
            "10.0.0.7:5123",
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["success"], true);

    let inst = f.catalog.instance("orders-1").await.unwrap().unwrap();
    assert_eq!(inst.address, "10.0.0.7");
}

#[tokio::test]
async fn test_register_generates_service_id() {
    let f = fixture();

    let response = f
        .app
        .clone()
        .oneshot(post_json(
            "/rpc/register",
            &json!({"serviceName": "orders", "address": "192.168.5.1", "port": 9000}),
            "10.0.0.7:5123",
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    let id = body["serviceId"].as_str().unwrap();
    assert!(id.starts_with("orders-"), "got {}", id);
}

#[tokio::test]
async fn test_deregister_round_trip() {
    let f = fixture();

    f.app
        .clone()
        .oneshot(post_json(
            "/rpc/register",
            &json!({
                "serviceName": "orders",
                "serviceId": "orders-1",
                "address": "192.168.5.1",
                "port": 9000,
            }),
            "10.0.0.7:5123",
        ))
        .await
        .unwrap();

    let response = f
        .app
        .clone()
        .oneshot(post_json(
            "/rpc/deregister",
            &json!({"serviceId": "orders-1"}),
            "10.0.0.7:5123",
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["removed"], true);

    // A second deregistration no longer finds the instance.
    let response = f
        .app
        .oneshot(post_json(
            "/rpc/deregister",
            &json!({"serviceId": "orders-1"}),
            "10.0.0.7:5123",
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["removed"], false);

    let events = f.publisher.events();
    assert!(matches!(events[0], DomainEvent::Registered(_)));
    assert!(matches!(events[1], DomainEvent::Deregistered(_)));
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn test_report_health_updates_catalog() {
    let f = fixture();

    f.app
        .clone()
        .oneshot(post_json(
            "/rpc/register",
            &json!({
                "serviceName": "orders",
                "serviceId": "orders-1",
                "address": "192.168.5.1",
                "port": 9000,
            }),
            "10.0.0.7:5123",
        ))
        .await
        .unwrap();

    let response = f
        .app
        .clone()
        .oneshot(post_json(
            "/rpc/report-health",
            &json!({"serviceId": "orders-1", "status": "Degraded", "output": "high latency"}),
            "10.0.0.7:5123",
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["success"], true);

    let inst = f.catalog.instance("orders-1").await.unwrap().unwrap();
    assert_eq!(inst.status.name(), "Degraded");

    let transitions: Vec<_> = f
        .publisher
        .events()
        .into_iter()
        .filter(|e| matches!(e, DomainEvent::HealthChanged(_)))
        .collect();
    assert_eq!(transitions.len(), 1);
}

#[tokio::test]
async fn test_health_and_reflection_endpoints() {
    let f = fixture();

    let response = f
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "Healthy"}));

    let response = f
        .app
        .oneshot(
            Request::builder()
                .uri("/rpc/methods")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let methods = body_json(response).await;
    let names: Vec<&str> = methods
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec!["Register", "Deregister", "GetInstances", "GetServices", "ReportHealth"]
    );
}
