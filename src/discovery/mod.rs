//! Discovery Registry - service registration, health reporting, and
//! instance queries over the external catalog
//!
//! The RPC surface is HTTP/JSON; user-level failures are structured
//! `{success: false, errorMessage}` responses, never transport errors.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, State},
    http::request::Parts,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::catalog::{Catalog, HealthCheckSpec, HealthStatus, Registration, ServiceInstance};
use crate::error::AppError;
use crate::messaging::{
    generate_id, DomainEvent, EventPublisher, ServiceDeregisteredEvent, ServiceHealthChangedEvent,
    ServiceRegisteredEvent,
};

/// In-memory shadow of a registration, holding the metadata and timestamps
/// the catalog doesn't store. The catalog stays the source of truth for
/// liveness.
struct TrackingInfo {
    service_name: String,
    registered_at: DateTime<Utc>,
    #[allow(dead_code)]
    deregistered_at: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
    status: HealthStatus,
    last_health_check: Option<DateTime<Utc>>,
    metadata: HashMap<String, String>,
}

/// The discovery registry service
pub struct DiscoveryService {
    catalog: Arc<dyn Catalog>,
    publisher: Arc<dyn EventPublisher>,
    tracking: RwLock<HashMap<String, TrackingInfo>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub service_name: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    pub service_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeregisterRequest {
    pub service_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterResponse {
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancesResponse {
    pub instances: Vec<ServiceInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicesResponse {
    pub service_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportHealthRequest {
    pub service_id: String,
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportHealthResponse {
    pub success: bool,
}

impl DiscoveryService {
    pub fn new(catalog: Arc<dyn Catalog>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            catalog,
            publisher,
            tracking: RwLock::new(HashMap::new()),
        }
    }

    /// Register a service instance. Generates an ID when none is supplied
    /// and rewrites non-routable addresses to the caller's peer IP.
    pub async fn register(&self, req: RegisterRequest, peer: Option<IpAddr>) -> RegisterResponse {
        if let Err(e) = validate_registration(&req) {
            return RegisterResponse {
                success: false,
                service_id: req.service_id,
                error_message: Some(e.to_string()),
            };
        }

        let service_id = if req.service_id.is_empty() {
            format!("{}-{}", req.service_name, generate_id())
        } else {
            req.service_id.clone()
        };

        let address = resolve_address(&req.address, peer);

        let registration = Registration {
            service_name: req.service_name.clone(),
            service_id: service_id.clone(),
            address: address.clone(),
            port: req.port,
            metadata: req.metadata.clone(),
            health_check: req.health_check.clone(),
        };

        if let Err(e) = self.catalog.register(registration).await {
            error!(service_id = %service_id, error = %e, "registration failed");
            return RegisterResponse {
                success: false,
                service_id,
                error_message: Some(e.to_string()),
            };
        }

        let now = Utc::now();
        self.tracking.write().insert(
            service_id.clone(),
            TrackingInfo {
                service_name: req.service_name.clone(),
                registered_at: now,
                deregistered_at: None,
                last_updated: now,
                status: HealthStatus::Healthy,
                last_health_check: None,
                metadata: req.metadata.clone(),
            },
        );

        self.publish(DomainEvent::Registered(ServiceRegisteredEvent {
            event_id: generate_id(),
            timestamp: now,
            correlation_id: None,
            service_id: service_id.clone(),
            service_name: req.service_name.clone(),
            address: address.clone(),
            port: req.port,
            metadata: req.metadata,
        }))
        .await;

        info!(
            service_id = %service_id,
            service_name = %req.service_name,
            address = %address,
            port = req.port,
            "service registered"
        );

        RegisterResponse {
            success: true,
            service_id,
            error_message: None,
        }
    }

    /// Remove a service instance from the catalog.
    pub async fn deregister(&self, req: DeregisterRequest) -> DeregisterResponse {
        // Capture the service name before deregistration for the event.
        let service_name = self
            .tracking
            .read()
            .get(&req.service_id)
            .map(|info| info.service_name.clone())
            .unwrap_or_default();

        if let Err(e) = self.catalog.deregister(&req.service_id).await {
            error!(service_id = %req.service_id, error = %e, "deregistration failed");
            return DeregisterResponse { removed: false };
        }

        let now = Utc::now();
        if let Some(info) = self.tracking.write().get_mut(&req.service_id) {
            info.deregistered_at = Some(now);
            info.last_updated = now;
        }

        self.publish(DomainEvent::Deregistered(ServiceDeregisteredEvent {
            event_id: generate_id(),
            timestamp: now,
            correlation_id: None,
            service_id: req.service_id,
            service_name,
            reason: Some("Manual deregistration".to_string()),
        }))
        .await;

        DeregisterResponse { removed: true }
    }

    /// List instances of a service, augmented with tracked metadata and
    /// timestamps. Catalog metadata wins on key conflicts.
    pub async fn get_instances(&self, service_name: &str) -> crate::error::Result<InstancesResponse> {
        let mut instances = self.catalog.instances(service_name).await?;

        let tracking = self.tracking.read();
        for inst in &mut instances {
            if let Some(info) = tracking.get(&inst.service_id) {
                for (key, value) in &info.metadata {
                    inst.metadata
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                inst.registered_at = Some(info.registered_at);
                inst.last_health_check = info.last_health_check;
            }
        }

        Ok(InstancesResponse { instances })
    }

    /// List all registered service names.
    pub async fn get_services(&self) -> crate::error::Result<ServicesResponse> {
        let service_names = self.catalog.services().await?;
        Ok(ServicesResponse { service_names })
    }

    /// Translate a self-reported health status into the catalog's TTL
    /// operation and emit a transition event if the tracked status changed.
    pub async fn report_health(&self, req: ReportHealthRequest) -> ReportHealthResponse {
        let (previous, service_name) = {
            let tracking = self.tracking.read();
            match tracking.get(&req.service_id) {
                Some(info) => (Some(info.status), info.service_name.clone()),
                None => (None, String::new()),
            }
        };

        if let Err(e) = self
            .catalog
            .update_health(&req.service_id, req.status, &req.output)
            .await
        {
            error!(service_id = %req.service_id, error = %e, "health update failed");
            return ReportHealthResponse { success: false };
        }

        let now = Utc::now();
        if let Some(info) = self.tracking.write().get_mut(&req.service_id) {
            info.status = req.status;
            info.last_health_check = Some(now);
            info.last_updated = now;
        }

        if let Some(previous) = previous {
            if previous != req.status {
                self.publish(DomainEvent::HealthChanged(ServiceHealthChangedEvent {
                    event_id: generate_id(),
                    timestamp: now,
                    correlation_id: None,
                    service_id: req.service_id,
                    service_name,
                    previous_status: previous.name().to_string(),
                    current_status: req.status.name().to_string(),
                    health_check_output: if req.output.is_empty() {
                        None
                    } else {
                        Some(req.output)
                    },
                }))
                .await;
            }
        }

        ReportHealthResponse { success: true }
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            warn!(error = %e, "failed to publish event");
        }
    }
}

fn validate_registration(req: &RegisterRequest) -> Result<(), AppError> {
    if req.service_name.is_empty() {
        return Err(AppError::InvalidRequest("service name cannot be empty".to_string()));
    }
    if req.port == 0 {
        return Err(AppError::InvalidRequest(format!(
            "service '{}' must have a non-zero port",
            req.service_name
        )));
    }
    Ok(())
}

/// Replace loopback or unspecified addresses with the caller's peer IP.
fn resolve_address(requested: &str, peer: Option<IpAddr>) -> String {
    if is_routable(requested) {
        return requested.to_string();
    }

    if let Some(ip) = peer {
        let host = ip.to_string();
        if is_routable(&host) {
            return host;
        }
    }

    if !requested.is_empty() {
        return requested.to_string();
    }
    "127.0.0.1".to_string()
}

/// Whether an address can be reached by other mesh members. Hostnames are
/// assumed routable.
fn is_routable(addr: &str) -> bool {
    if addr.is_empty() || addr == "0.0.0.0" || addr == "::" {
        return false;
    }
    match addr.parse::<IpAddr>() {
        Ok(ip) => !ip.is_loopback() && !ip.is_unspecified(),
        Err(_) => true,
    }
}

// --- HTTP surface ---

/// Peer IP extracted from the connection, when available.
struct PeerAddr(Option<IpAddr>);

impl<S: Send + Sync> FromRequestParts<S> for PeerAddr {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(PeerAddr(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip()),
        ))
    }
}

/// Build the discovery HTTP router.
pub fn router(service: Arc<DiscoveryService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rpc/methods", get(methods))
        .route("/rpc/register", post(register))
        .route("/rpc/deregister", post(deregister))
        .route("/rpc/instances/{serviceName}", get(instances))
        .route("/rpc/services", get(services))
        .route("/rpc/report-health", post(report_health))
        .with_state(service)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "Healthy"}))
}

/// Operation descriptors for debugging clients.
async fn methods() -> Json<serde_json::Value> {
    Json(json!([
        {"name": "Register", "method": "POST", "path": "/rpc/register"},
        {"name": "Deregister", "method": "POST", "path": "/rpc/deregister"},
        {"name": "GetInstances", "method": "GET", "path": "/rpc/instances/{serviceName}"},
        {"name": "GetServices", "method": "GET", "path": "/rpc/services"},
        {"name": "ReportHealth", "method": "POST", "path": "/rpc/report-health"},
    ]))
}

async fn register(
    State(service): State<Arc<DiscoveryService>>,
    PeerAddr(peer): PeerAddr,
    Json(req): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    Json(service.register(req, peer).await)
}

async fn deregister(
    State(service): State<Arc<DiscoveryService>>,
    Json(req): Json<DeregisterRequest>,
) -> Json<DeregisterResponse> {
    Json(service.deregister(req).await)
}

async fn instances(
    State(service): State<Arc<DiscoveryService>>,
    Path(service_name): Path<String>,
) -> Result<Json<InstancesResponse>, AppError> {
    Ok(Json(service.get_instances(&service_name).await?))
}

async fn services(
    State(service): State<Arc<DiscoveryService>>,
) -> Result<Json<ServicesResponse>, AppError> {
    Ok(Json(service.get_services().await?))
}

async fn report_health(
    State(service): State<Arc<DiscoveryService>>,
    Json(req): Json<ReportHealthRequest>,
) -> Json<ReportHealthResponse> {
    Json(service.report_health(req).await)
}
