//! In-memory catalog used by tests and local development

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::catalog::{Catalog, HealthStatus, Registration, ServiceInstance};
use crate::error::{AppError, Result};

/// A catalog that keeps all state in process memory.
#[derive(Default)]
pub struct MemoryCatalog {
    instances: RwLock<HashMap<String, ServiceInstance>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an instance directly, bypassing registration.
    pub fn upsert(&self, instance: ServiceInstance) {
        self.instances
            .write()
            .insert(instance.service_id.clone(), instance);
    }

    /// Remove an instance directly, bypassing deregistration.
    pub fn remove(&self, service_id: &str) {
        self.instances.write().remove(service_id);
    }

    /// Overwrite the stored status of an instance, if present.
    pub fn set_status(&self, service_id: &str, status: HealthStatus) {
        if let Some(inst) = self.instances.write().get_mut(service_id) {
            inst.status = status;
        }
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn register(&self, reg: Registration) -> Result<()> {
        // The TTL check is passed immediately on registration, so the
        // instance starts out Healthy just like the real agent.
        let instance = ServiceInstance {
            service_name: reg.service_name,
            service_id: reg.service_id.clone(),
            address: reg.address,
            port: reg.port,
            status: HealthStatus::Healthy,
            metadata: reg.metadata,
            registered_at: Some(Utc::now()),
            last_health_check: None,
        };
        self.instances.write().insert(reg.service_id, instance);
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        match self.instances.write().remove(service_id) {
            Some(_) => Ok(()),
            None => Err(AppError::ServiceNotFound(service_id.to_string())),
        }
    }

    async fn services(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for inst in self.instances.read().values() {
            if !names.contains(&inst.service_name) {
                names.push(inst.service_name.clone());
            }
        }
        Ok(names)
    }

    async fn instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|inst| inst.service_name == service_name)
            .cloned()
            .collect())
    }

    async fn instance(&self, service_id: &str) -> Result<Option<ServiceInstance>> {
        Ok(self.instances.read().get(service_id).cloned())
    }

    async fn update_health(&self, service_id: &str, status: HealthStatus, _output: &str) -> Result<()> {
        let mut instances = self.instances.write();
        let inst = instances
            .get_mut(service_id)
            .ok_or_else(|| AppError::ServiceNotFound(service_id.to_string()))?;
        inst.status = status;
        inst.last_health_check = Some(Utc::now());
        Ok(())
    }
}
