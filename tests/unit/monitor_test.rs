//! Integration tests for the health monitor probe engine

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};

use lattice_mesh::catalog::memory::MemoryCatalog;
use lattice_mesh::catalog::{HealthStatus, ServiceInstance};
use lattice_mesh::config::ProbeConfig;
use lattice_mesh::messaging::{CollectingPublisher, DomainEvent};
use lattice_mesh::monitor::{ProbeType, StatusCache, Worker};

async fn spawn_backend(app: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

async fn toggling_backend(healthy: Arc<AtomicBool>) -> u16 {
    async fn handler(State(healthy): State<Arc<AtomicBool>>) -> impl IntoResponse {
        if healthy.load(Ordering::SeqCst) {
            (StatusCode::OK, "ok")
        } else {
            (StatusCode::INTERNAL_SERVER_ERROR, "down")
        }
    }
    spawn_backend(
        Router::new()
            .route("/healthz", get(handler))
            .with_state(healthy),
    )
    .await
}

fn http_probed_instance(service_id: &str, port: u16) -> ServiceInstance {
    let mut metadata = HashMap::new();
    metadata.insert("health_check_endpoint".to_string(), "/healthz".to_string());
    ServiceInstance {
        service_name: "svc".to_string(),
        service_id: service_id.to_string(),
        address: "127.0.0.1".to_string(),
        port,
        status: HealthStatus::Healthy,
        metadata,
        registered_at: None,
        last_health_check: None,
    }
}

fn probe_config(failure_threshold: u32) -> ProbeConfig {
    ProbeConfig {
        interval_secs: 30,
        http_timeout_secs: 2,
        tcp_timeout_secs: 1,
        failure_threshold,
        recovery_threshold: 1,
        http_headers: HashMap::new(),
    }
}

struct Fixture {
    catalog: Arc<MemoryCatalog>,
    publisher: Arc<CollectingPublisher>,
    cache: Arc<StatusCache>,
    worker: Arc<Worker>,
}

fn fixture(failure_threshold: u32) -> Fixture {
    let catalog = Arc::new(MemoryCatalog::new());
    let publisher = Arc::new(CollectingPublisher::new());
    let cache = Arc::new(StatusCache::new());
    let worker = Arc::new(
        Worker::new(
            catalog.clone(),
            publisher.clone(),
            cache.clone(),
            probe_config(failure_threshold),
        )
        .unwrap(),
    );
    Fixture {
        catalog,
        publisher,
        cache,
        worker,
    }
}

#[tokio::test]
async fn test_transition_publishes_event_once() {
    let healthy = Arc::new(AtomicBool::new(true));
    let port = toggling_backend(healthy.clone()).await;

    let f = fixture(10);
    f.catalog.upsert(http_probed_instance("svc-1", port));

    // Cycle 1: healthy, no previous status, no event.
    f.worker.clone().probe_all().await;
    assert_eq!(f.cache.get("svc-1").unwrap().status, HealthStatus::Healthy);
    assert!(f.publisher.events().is_empty());

    // Cycle 2: backend degrades, Healthy -> Unhealthy event.
    healthy.store(false, Ordering::SeqCst);
    f.worker.clone().probe_all().await;
    assert_eq!(f.cache.get("svc-1").unwrap().status, HealthStatus::Unhealthy);

    let events = f.publisher.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        DomainEvent::HealthChanged(e) => {
            assert_eq!(e.service_id, "svc-1");
            assert_eq!(e.previous_status, "Healthy");
            assert_eq!(e.current_status, "Unhealthy");
            assert_eq!(e.health_check_output.as_deref(), Some("HTTP 500"));
        }
        other => panic!("expected health changed event, got {:?}", other),
    }

    // Cycle 3: still unhealthy, no further event.
    f.worker.clone().probe_all().await;
    assert_eq!(f.publisher.events().len(), 1);
}

#[tokio::test]
async fn test_evicts_instances_absent_from_catalog() {
    let healthy = Arc::new(AtomicBool::new(true));
    let port = toggling_backend(healthy).await;

    let f = fixture(3);
    f.catalog.upsert(http_probed_instance("svc-1", port));

    f.worker.clone().probe_all().await;
    assert!(f.cache.get("svc-1").is_some());

    f.catalog.remove("svc-1");
    f.worker.clone().probe_all().await;
    assert!(f.cache.get("svc-1").is_none());
}

#[tokio::test]
async fn test_breaker_short_circuits_after_repeated_failures() {
    let f = fixture(1);
    // Nothing listens on port 1: every probe is a transport failure.
    f.catalog.upsert(http_probed_instance("svc-1", 1));

    // First cycle records the failure and opens the breaker.
    f.worker.clone().probe_all().await;
    let entry = f.cache.get("svc-1").unwrap();
    assert_eq!(entry.status, HealthStatus::Unhealthy);
    assert_eq!(entry.probe_type, ProbeType::Http);

    // Second cycle is refused by the breaker without network I/O.
    f.worker.clone().probe_all().await;
    let entry = f.cache.get("svc-1").unwrap();
    assert_eq!(entry.status, HealthStatus::Unhealthy);
    assert_eq!(entry.probe_type, ProbeType::CircuitBreaker);
    assert_eq!(entry.message, "Circuit open due to repeated failures");
}

#[tokio::test]
async fn test_unconfigured_instance_probes_unknown_without_event() {
    let f = fixture(3);
    f.catalog.upsert(ServiceInstance {
        service_name: "svc".to_string(),
        service_id: "bare-1".to_string(),
        address: "127.0.0.1".to_string(),
        port: 8080,
        status: HealthStatus::Healthy,
        metadata: HashMap::new(),
        registered_at: None,
        last_health_check: None,
    });

    f.worker.clone().probe_all().await;
    let entry = f.cache.get("bare-1").unwrap();
    assert_eq!(entry.status, HealthStatus::Unknown);
    assert_eq!(entry.probe_type, ProbeType::None);
    assert_eq!(entry.message, "No probe configuration available");
    assert!(f.publisher.events().is_empty());
}

#[tokio::test]
async fn test_probes_multiple_services_concurrently() {
    let healthy = Arc::new(AtomicBool::new(true));
    let port = toggling_backend(healthy).await;

    let f = fixture(3);
    for (name, id) in [("alpha", "alpha-1"), ("beta", "beta-1"), ("beta", "beta-2")] {
        let mut inst = http_probed_instance(id, port);
        inst.service_name = name.to_string();
        f.catalog.upsert(inst);
    }

    f.worker.clone().probe_all().await;

    assert_eq!(f.cache.get_all().len(), 3);
    assert_eq!(f.cache.get_by_service("beta").len(), 2);
    for entry in f.cache.get_all() {
        assert_eq!(entry.status, HealthStatus::Healthy);
    }
}
