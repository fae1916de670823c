//! Thread-safe store of the latest health probe results

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::catalog::HealthStatus;

/// How an instance was probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeType {
    Http,
    Tcp,
    CircuitBreaker,
    None,
}

/// Latest probe result for a single service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredInstance {
    pub service_id: String,
    pub service_name: String,
    pub address: String,
    pub port: u16,
    pub status: HealthStatus,
    pub last_probe: DateTime<Utc>,
    pub probe_type: ProbeType,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub message: String,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub metadata: HashMap<String, String>,
}

/// Probe-result cache keyed by service ID.
///
/// All mutations are serialized; reads return point-in-time copies.
#[derive(Default)]
pub struct StatusCache {
    instances: RwLock<HashMap<String, MonitoredInstance>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a probe result, overwriting any previous entry.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        service_id: &str,
        service_name: &str,
        address: &str,
        port: u16,
        status: HealthStatus,
        probe_type: ProbeType,
        message: String,
        metadata: HashMap<String, String>,
    ) {
        let entry = MonitoredInstance {
            service_id: service_id.to_string(),
            service_name: service_name.to_string(),
            address: address.to_string(),
            port,
            status,
            last_probe: Utc::now(),
            probe_type,
            message,
            metadata,
        };
        self.instances.write().insert(service_id.to_string(), entry);
    }

    /// Snapshot of all monitored instances.
    pub fn get_all(&self) -> Vec<MonitoredInstance> {
        self.instances.read().values().cloned().collect()
    }

    /// Monitored instances matching the given service name.
    pub fn get_by_service(&self, service_name: &str) -> Vec<MonitoredInstance> {
        self.instances
            .read()
            .values()
            .filter(|inst| inst.service_name == service_name)
            .cloned()
            .collect()
    }

    /// Copy of a single instance entry, or None.
    pub fn get(&self, service_id: &str) -> Option<MonitoredInstance> {
        self.instances.read().get(service_id).cloned()
    }

    /// Remove a single instance entry.
    pub fn remove(&self, service_id: &str) {
        self.instances.write().remove(service_id);
    }

    /// Remove all entries for a service name.
    pub fn remove_by_service(&self, service_name: &str) {
        self.instances
            .write()
            .retain(|_, inst| inst.service_name != service_name);
    }

    /// Remove entries whose last probe predates the cutoff.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) {
        self.instances
            .write()
            .retain(|_, inst| inst.last_probe >= cutoff);
    }

    /// Last known status for a service ID; Unknown if not tracked.
    pub fn previous_status(&self, service_id: &str) -> HealthStatus {
        self.instances
            .read()
            .get(service_id)
            .map(|inst| inst.status)
            .unwrap_or_default()
    }
}
