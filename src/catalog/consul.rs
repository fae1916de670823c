//! Consul agent HTTP adapter with TTL-based health checking

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::{Catalog, HealthStatus, Registration, ServiceInstance};
use crate::error::{AppError, Result};

/// Consul-backed service catalog
pub struct ConsulCatalog {
    base_url: String,
    client: Client,

    // Consul does not store registration instants; remember the ones made
    // through this process so instance listings can report them.
    registration_times: RwLock<HashMap<String, DateTime<Utc>>>,
}

#[derive(Debug, Serialize)]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Meta")]
    meta: &'a HashMap<String, String>,
    #[serde(rename = "Check")]
    check: AgentServiceCheck,
}

#[derive(Debug, Serialize)]
struct AgentServiceCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_service_after: String,
}

#[derive(Debug, Deserialize)]
struct HealthServiceEntry {
    #[serde(rename = "Service")]
    service: AgentService,
    #[serde(rename = "Checks", default)]
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct HealthCheck {
    #[serde(rename = "Status", default)]
    status: String,
}

impl ConsulCatalog {
    /// Create a catalog client for the given agent address (e.g. `http://localhost:8500`).
    pub fn new(address: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: address.trim_end_matches('/').to_string(),
            client,
            registration_times: RwLock::new(HashMap::new()),
        })
    }

    fn check_id(service_id: &str) -> String {
        format!("service:{}", service_id)
    }

    async fn ttl_update(&self, verb: &str, service_id: &str, note: &str) -> Result<()> {
        let url = format!(
            "{}/v1/agent/check/{}/{}",
            self.base_url,
            verb,
            Self::check_id(service_id)
        );
        let resp = self.client.put(&url).query(&[("note", note)]).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(AppError::ServiceNotFound(service_id.to_string()));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Catalog(format!("ttl {} returned {}: {}", verb, status, body)));
        }
        Ok(())
    }

    fn registration_time(&self, service_id: &str) -> Option<DateTime<Utc>> {
        self.registration_times.read().get(service_id).copied()
    }
}

#[async_trait]
impl Catalog for ConsulCatalog {
    async fn register(&self, reg: Registration) -> Result<()> {
        let mut ttl_interval = Duration::from_secs(30);
        if let Some(hc) = &reg.health_check {
            if hc.interval_seconds > 0 {
                ttl_interval = Duration::from_secs(hc.interval_seconds as u64);
            }
        }

        // TTL gets a grace buffer so a well-behaved service never expires
        // between reports; floor of 10s.
        let ttl = std::cmp::max(ttl_interval + Duration::from_secs(5), Duration::from_secs(10));

        let body = AgentServiceRegistration {
            id: &reg.service_id,
            name: &reg.service_name,
            address: &reg.address,
            port: reg.port,
            meta: &reg.metadata,
            check: AgentServiceCheck {
                check_id: Self::check_id(&reg.service_id),
                name: format!("{} TTL Health", reg.service_name),
                ttl: format!("{}s", ttl.as_secs()),
                deregister_critical_service_after: "1m".to_string(),
            },
        };

        let url = format!("{}/v1/agent/service/register", self.base_url);
        let resp = self.client.put(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Catalog(format!("register returned {}: {}", status, text)));
        }

        // Mark the TTL check as passing so the service starts healthy.
        if let Err(e) = self.ttl_update("pass", &reg.service_id, "Service registered").await {
            warn!(service_id = %reg.service_id, error = %e, "failed to pass initial TTL");
        }

        self.registration_times
            .write()
            .insert(reg.service_id.clone(), Utc::now());

        info!(
            service_id = %reg.service_id,
            service_name = %reg.service_name,
            "registered service"
        );
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, service_id);
        let resp = self.client.put(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(AppError::ServiceNotFound(service_id.to_string()));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Catalog(format!("deregister returned {}: {}", status, text)));
        }

        self.registration_times.write().remove(service_id);

        info!(service_id = %service_id, "deregistered service");
        Ok(())
    }

    async fn services(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/catalog/services", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::Catalog(format!("list services returned {}", resp.status())));
        }

        let services: HashMap<String, Vec<String>> = resp.json().await?;
        let names = services
            .into_keys()
            .filter(|name| name != "consul")
            .collect();
        Ok(names)
    }

    async fn instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let url = format!("{}/v1/health/service/{}", self.base_url, service_name);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::Catalog(format!(
                "list instances of {} returned {}",
                service_name,
                resp.status()
            )));
        }

        let entries: Vec<HealthServiceEntry> = resp.json().await?;
        let instances = entries
            .into_iter()
            .map(|entry| ServiceInstance {
                registered_at: self.registration_time(&entry.service.id),
                service_name: entry.service.service,
                service_id: entry.service.id,
                address: entry.service.address,
                port: entry.service.port,
                status: map_health_status(&entry.checks),
                metadata: entry.service.meta,
                last_health_check: None,
            })
            .collect();
        Ok(instances)
    }

    async fn instance(&self, service_id: &str) -> Result<Option<ServiceInstance>> {
        let url = format!("{}/v1/agent/service/{}", self.base_url, service_id);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(AppError::Catalog(format!(
                "get instance {} returned {}",
                service_id,
                resp.status()
            )));
        }

        let svc: AgentService = resp.json().await?;
        Ok(Some(ServiceInstance {
            registered_at: self.registration_time(&svc.id),
            service_name: svc.service,
            service_id: svc.id,
            address: svc.address,
            port: svc.port,
            status: HealthStatus::Unknown,
            metadata: svc.meta,
            last_health_check: None,
        }))
    }

    async fn update_health(&self, service_id: &str, status: HealthStatus, output: &str) -> Result<()> {
        let verb = match status {
            HealthStatus::Healthy => "pass",
            HealthStatus::Unhealthy => "fail",
            HealthStatus::Degraded => "warn",
            HealthStatus::Unknown => "pass",
        };
        self.ttl_update(verb, service_id, output).await
    }
}

/// Map the catalog's per-check status strings onto a single instance status.
fn map_health_status(checks: &[HealthCheck]) -> HealthStatus {
    if checks.is_empty() {
        return HealthStatus::Unknown;
    }

    if checks
        .iter()
        .any(|c| c.status == "critical" || c.status == "maintenance")
    {
        return HealthStatus::Unhealthy;
    }
    if checks.iter().any(|c| c.status == "warning") {
        return HealthStatus::Degraded;
    }
    if checks.iter().all(|c| c.status == "passing") {
        return HealthStatus::Healthy;
    }

    HealthStatus::Unknown
}
