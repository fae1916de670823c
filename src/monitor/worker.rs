//! Background health probe engine
//!
//! Periodically lists services from the catalog, probes every instance
//! concurrently (HTTP or TCP depending on metadata), caches the results,
//! emits health-transition events, and evicts cache entries for instances
//! that disappeared from the catalog.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use reqwest::Client;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::catalog::{Catalog, HealthStatus, ServiceInstance};
use crate::config::ProbeConfig;
use crate::error::{AppError, Result};
use crate::messaging::{generate_id, DomainEvent, EventPublisher, ServiceHealthChangedEvent};
use crate::monitor::breaker::CircuitBreaker;
use crate::monitor::cache::{ProbeType, StatusCache};

const CIRCUIT_OPEN_MESSAGE: &str = "Circuit open due to repeated failures";
const NO_PROBE_MESSAGE: &str = "No probe configuration available";

/// Health probe worker
pub struct Worker {
    catalog: Arc<dyn Catalog>,
    publisher: Arc<dyn EventPublisher>,
    cache: Arc<StatusCache>,
    config: ProbeConfig,
    client: Client,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Worker {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        publisher: Arc<dyn EventPublisher>,
        cache: Arc<StatusCache>,
        config: ProbeConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            catalog,
            publisher,
            cache,
            config,
            client,
            breakers: DashMap::new(),
        })
    }

    /// Run the probe loop: one cycle immediately, then one per interval.
    /// Returns when the shutdown signal fires; an in-flight cycle completes
    /// its dispatch first.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            probe_interval_secs = self.config.interval().as_secs(),
            failure_threshold = self.config.failure_threshold,
            "health probe worker starting"
        );

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("health probe worker stopping");
                    return;
                }
                _ = ticker.tick() => Arc::clone(&self).probe_all().await,
            }
        }
    }

    /// Execute a single probe cycle over every registered instance.
    pub async fn probe_all(self: Arc<Self>) {
        let services = match self.catalog.services().await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to list services");
                return;
            }
        };

        // Fan out at the service level so slow services don't block others;
        // each service task reports the instance IDs it saw.
        let mut tasks = JoinSet::new();
        for service_name in services {
            let worker = Arc::clone(&self);
            tasks.spawn(worker.probe_service(service_name));
        }

        let mut live_ids: HashSet<String> = HashSet::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(ids) => live_ids.extend(ids),
                Err(e) => error!(error = %e, "probe task panicked"),
            }
        }

        // Evict cache entries for instances no longer in the catalog.
        for cached in self.cache.get_all() {
            if !live_ids.contains(&cached.service_id) {
                self.cache.remove(&cached.service_id);
            }
        }
    }

    async fn probe_service(self: Arc<Self>, service_name: String) -> Vec<String> {
        let instances = match self.catalog.instances(&service_name).await {
            Ok(i) => i,
            Err(e) => {
                error!(service = %service_name, error = %e, "failed to list instances");
                return Vec::new();
            }
        };

        let ids: Vec<String> = instances.iter().map(|i| i.service_id.clone()).collect();

        let mut tasks = JoinSet::new();
        for inst in instances {
            let worker = Arc::clone(&self);
            tasks.spawn(async move { worker.probe_instance(inst).await });
        }
        while tasks.join_next().await.is_some() {}

        ids
    }

    async fn probe_instance(&self, inst: ServiceInstance) {
        let breaker = self.breaker(&inst.service_id);

        if !breaker.allow() {
            self.update_status(
                &inst,
                HealthStatus::Unhealthy,
                ProbeType::CircuitBreaker,
                CIRCUIT_OPEN_MESSAGE.to_string(),
            )
            .await;
            return;
        }

        let (status, probe_type, message) = self.run_probes(&inst).await;

        if status == HealthStatus::Healthy {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }

        self.update_status(&inst, status, probe_type, message).await;
    }

    async fn run_probes(&self, inst: &ServiceInstance) -> (HealthStatus, ProbeType, String) {
        // HTTP probe takes priority over TCP.
        if let Some(endpoint) = inst.metadata.get("health_check_endpoint") {
            if !endpoint.is_empty() {
                let (status, message) = self.http_probe(inst, endpoint).await;
                return (status, ProbeType::Http, message);
            }
        }

        if let Some(port) = inst.metadata.get("tcp_port") {
            if !port.is_empty() {
                let (status, message) = self.tcp_probe(inst, port).await;
                return (status, ProbeType::Tcp, message);
            }
        }

        (HealthStatus::Unknown, ProbeType::None, NO_PROBE_MESSAGE.to_string())
    }

    async fn http_probe(&self, inst: &ServiceInstance, endpoint: &str) -> (HealthStatus, String) {
        let url = format!("{}://{}:{}{}", inst.scheme(), inst.address, inst.port, endpoint);

        let mut request = self.client.get(&url).timeout(self.config.http_timeout());
        for (key, value) in &self.config.http_headers {
            request = request.header(key.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(resp) => {
                let code = resp.status().as_u16();
                if resp.status().is_success() {
                    (HealthStatus::Healthy, format!("HTTP {}", code))
                } else {
                    (HealthStatus::Unhealthy, format!("HTTP {}", code))
                }
            }
            Err(e) => (HealthStatus::Unhealthy, format!("probe failed: {}", e)),
        }
    }

    async fn tcp_probe(&self, inst: &ServiceInstance, port_str: &str) -> (HealthStatus, String) {
        let port: u16 = match port_str.parse() {
            Ok(p) => p,
            Err(_) => {
                return (
                    HealthStatus::Unhealthy,
                    format!("TCP connection failed: invalid port {:?}", port_str),
                )
            }
        };

        let connect = TcpStream::connect((inst.address.as_str(), port));
        match tokio::time::timeout(self.config.tcp_timeout(), connect).await {
            Ok(Ok(_)) => (HealthStatus::Healthy, "TCP connection successful".to_string()),
            Ok(Err(e)) => (HealthStatus::Unhealthy, format!("TCP connection failed: {}", e)),
            Err(_) => (
                HealthStatus::Unhealthy,
                "TCP connection failed: connection timed out".to_string(),
            ),
        }
    }

    async fn update_status(
        &self,
        inst: &ServiceInstance,
        status: HealthStatus,
        probe_type: ProbeType,
        message: String,
    ) {
        let previous = self.cache.previous_status(&inst.service_id);

        self.cache.update(
            &inst.service_id,
            &inst.service_name,
            &inst.address,
            inst.port,
            status,
            probe_type,
            message.clone(),
            inst.metadata.clone(),
        );

        // Publish a health change event only on a real transition.
        if previous != status && previous != HealthStatus::Unknown {
            let event = DomainEvent::HealthChanged(ServiceHealthChangedEvent {
                event_id: generate_id(),
                timestamp: Utc::now(),
                correlation_id: None,
                service_id: inst.service_id.clone(),
                service_name: inst.service_name.clone(),
                previous_status: previous.name().to_string(),
                current_status: status.name().to_string(),
                health_check_output: Some(message),
            });

            if let Err(e) = self.publisher.publish(event).await {
                warn!(service_id = %inst.service_id, error = %e, "failed to publish health change event");
            }
        }
    }

    fn breaker(&self, service_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service_id.to_string())
            .or_insert_with(|| {
                let break_duration = self.config.interval() * 2;
                Arc::new(CircuitBreaker::with_recovery(
                    self.config.failure_threshold,
                    self.config.recovery_threshold,
                    break_duration,
                ))
            })
            .clone()
    }
}
