//! Service catalog abstraction - shared domain types and the catalog trait
//!
//! The external catalog (a Consul-compatible agent) is the source of truth
//! for instance registrations and health check outcomes. Components talk to
//! it through the [`Catalog`] trait so tests can substitute an in-memory
//! implementation.

pub mod consul;
pub mod memory;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Health state of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Degraded,
}

impl HealthStatus {
    /// Canonical capitalized name, matching the wire form.
    pub fn name(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Unhealthy => "Unhealthy",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::Unknown => "Unknown",
        }
    }

    /// Parse a status name (case-insensitive). Unrecognized names map to Unknown.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            "degraded" => HealthStatus::Degraded,
            _ => HealthStatus::Unknown,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A service instance as stored in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub service_name: String,
    pub service_id: String,
    pub address: String,
    pub port: u16,
    pub status: HealthStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    /// URL scheme for this instance, from the `scheme` metadata key (default http).
    pub fn scheme(&self) -> &str {
        match self.metadata.get("scheme") {
            Some(s) if !s.is_empty() => s,
            _ => "http",
        }
    }
}

/// Health check parameters supplied at registration time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub interval_seconds: u32,
    #[serde(default)]
    pub timeout_seconds: u32,
    #[serde(default)]
    pub unhealthy_threshold: u32,
}

/// The information needed to register a service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub service_name: String,
    pub service_id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

/// Service catalog operations used by the control plane
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Register a service instance with a TTL health check.
    async fn register(&self, reg: Registration) -> Result<()>;

    /// Remove a service instance.
    async fn deregister(&self, service_id: &str) -> Result<()>;

    /// List all registered service names.
    async fn services(&self) -> Result<Vec<String>>;

    /// List all instances of a service, including mapped health status.
    async fn instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>>;

    /// Look up a single instance by ID, or None if absent. The agent-level
    /// lookup carries no health information, so the status is Unknown.
    async fn instance(&self, service_id: &str) -> Result<Option<ServiceInstance>>;

    /// Update the TTL health check for an instance.
    async fn update_health(&self, service_id: &str, status: HealthStatus, output: &str) -> Result<()>;
}
