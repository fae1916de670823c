//! Strategy-driven load balancing across service instances
//!
//! Instances are fetched through the [`InstanceProvider`] seam so the
//! balancer is decoupled from the catalog implementation. Selection prefers
//! Healthy instances and falls back to any non-Unknown instance as a
//! best-effort policy.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;

use crate::catalog::{Catalog, HealthStatus, ServiceInstance};
use crate::error::Result;

/// Load balancing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
    WeightedRoundRobin,
    IpHash,
}

impl Strategy {
    /// Parse a strategy name (case-insensitive, CamelCase or snake_case).
    /// Unrecognized names map to RoundRobin.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "roundrobin" | "round_robin" => Strategy::RoundRobin,
            "leastconnections" | "least_connections" => Strategy::LeastConnections,
            "random" => Strategy::Random,
            "weightedroundrobin" | "weighted_round_robin" => Strategy::WeightedRoundRobin,
            "iphash" | "ip_hash" => Strategy::IpHash,
            _ => Strategy::RoundRobin,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::RoundRobin => "RoundRobin",
            Strategy::LeastConnections => "LeastConnections",
            Strategy::Random => "Random",
            Strategy::WeightedRoundRobin => "WeightedRoundRobin",
            Strategy::IpHash => "IPHash",
        };
        f.write_str(s)
    }
}

/// Request-scoped information for load balancing decisions
#[derive(Debug, Clone, Default)]
pub struct LbContext {
    pub preferred_zone: Option<String>,
    pub headers: HashMap<String, String>,
    pub session_id: Option<String>,
}

/// Outcome of a proxied request, fed back for connection tracking
#[derive(Debug, Clone)]
pub struct RequestResult {
    pub success: bool,
    pub response_time: Duration,
    pub status_code: u16,
    pub error_message: Option<String>,
}

/// Aggregate load balancing statistics for a service
#[derive(Debug, Clone, Default)]
pub struct LbStats {
    pub service_name: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time: Duration,
    pub instance_request_counts: HashMap<String, u64>,
}

/// Fetches instances for a service name.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    async fn instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>>;
}

/// Provider backed by the external catalog.
pub struct CatalogInstanceProvider {
    catalog: Arc<dyn Catalog>,
}

impl CatalogInstanceProvider {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl InstanceProvider for CatalogInstanceProvider {
    async fn instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        self.catalog.instances(service_name).await
    }
}

struct ServiceStats {
    service_name: String,
    total_requests: AtomicI64,
    successful_requests: AtomicI64,
    failed_requests: AtomicI64,
    total_response_nanos: AtomicI64,
    instance_counts: Mutex<HashMap<String, u64>>,
}

impl ServiceStats {
    fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            total_requests: AtomicI64::new(0),
            successful_requests: AtomicI64::new(0),
            failed_requests: AtomicI64::new(0),
            total_response_nanos: AtomicI64::new(0),
            instance_counts: Mutex::new(HashMap::new()),
        }
    }

    fn record_request(&self, instance_id: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        *self.instance_counts.lock().entry(instance_id.to_string()).or_insert(0) += 1;
    }

    fn report(&self, result: &RequestResult) {
        if result.success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.total_response_nanos
            .fetch_add(result.response_time.as_nanos() as i64, Ordering::Relaxed);
    }
}

/// Load balancer with per-service selection state and statistics.
pub struct LoadBalancer {
    provider: Arc<dyn InstanceProvider>,
    round_robin_idx: DashMap<String, Arc<AtomicI64>>,
    // serviceName -> serviceID -> in-flight connection count
    connection_counts: DashMap<String, Arc<DashMap<String, Arc<AtomicI64>>>>,
    // keyed by serviceID
    stats: DashMap<String, Arc<ServiceStats>>,
}

impl LoadBalancer {
    pub fn new(provider: Arc<dyn InstanceProvider>) -> Self {
        Self {
            provider,
            round_robin_idx: DashMap::new(),
            connection_counts: DashMap::new(),
            stats: DashMap::new(),
        }
    }

    /// Pick the next instance for the given service, or None when no viable
    /// candidate exists.
    pub async fn select(&self, service_name: &str, ctx: &LbContext) -> Result<Option<ServiceInstance>> {
        let instances = self.provider.instances(service_name).await?;

        let mut candidates: Vec<ServiceInstance> = instances
            .iter()
            .filter(|i| i.status == HealthStatus::Healthy)
            .cloned()
            .collect();
        if candidates.is_empty() {
            // Best-effort fallback: anything with a known status.
            candidates = instances
                .into_iter()
                .filter(|i| i.status != HealthStatus::Unknown)
                .collect();
        }
        if candidates.is_empty() {
            return Ok(None);
        }

        let strategy = resolve_strategy(&candidates);
        let selected = match strategy {
            Strategy::LeastConnections => self.select_least_connections(service_name, &candidates),
            Strategy::WeightedRoundRobin => self.select_weighted_round_robin(service_name, &candidates),
            Strategy::IpHash => select_ip_hash(&candidates, ctx),
            Strategy::Random => select_random(&candidates),
            Strategy::RoundRobin => self.select_round_robin(service_name, &candidates),
        };

        if let Some(inst) = &selected {
            self.record_request(service_name, inst);
        }

        Ok(selected)
    }

    /// Feed back a request outcome: releases the connection slot held by
    /// least-connections selection and records success/failure statistics.
    pub fn report_result(&self, service_id: &str, result: RequestResult) {
        for counts in self.connection_counts.iter() {
            if let Some(counter) = counts.value().get(service_id) {
                if counter.load(Ordering::Relaxed) > 0 {
                    counter.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        if let Some(stats) = self.stats.get(service_id) {
            stats.report(&result);
        }
    }

    /// Aggregate statistics for a service name.
    pub fn stats(&self, service_name: &str) -> LbStats {
        let mut out = LbStats {
            service_name: service_name.to_string(),
            ..Default::default()
        };

        let mut total_nanos: i64 = 0;
        for entry in self.stats.iter() {
            let stats = entry.value();
            if stats.service_name != service_name {
                continue;
            }
            out.total_requests += stats.total_requests.load(Ordering::Relaxed) as u64;
            out.successful_requests += stats.successful_requests.load(Ordering::Relaxed) as u64;
            out.failed_requests += stats.failed_requests.load(Ordering::Relaxed) as u64;
            total_nanos += stats.total_response_nanos.load(Ordering::Relaxed);

            for (instance_id, count) in stats.instance_counts.lock().iter() {
                *out.instance_request_counts.entry(instance_id.clone()).or_insert(0) += count;
            }
        }

        if out.total_requests > 0 {
            out.average_response_time = Duration::from_nanos((total_nanos as u64) / out.total_requests);
        }
        out
    }

    fn select_round_robin(&self, key: &str, candidates: &[ServiceInstance]) -> Option<ServiceInstance> {
        let idx = self
            .round_robin_idx
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone();
        let n = idx.fetch_add(1, Ordering::Relaxed) + 1;
        let i = (n.unsigned_abs() as usize) % candidates.len();
        Some(candidates[i].clone())
    }

    fn select_least_connections(
        &self,
        service_name: &str,
        candidates: &[ServiceInstance],
    ) -> Option<ServiceInstance> {
        let counts = self
            .connection_counts
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone();

        let mut best: Option<&ServiceInstance> = None;
        let mut best_count = i64::MAX;
        for inst in candidates {
            let counter = counts
                .entry(inst.service_id.clone())
                .or_insert_with(|| Arc::new(AtomicI64::new(0)))
                .clone();
            let current = counter.load(Ordering::Relaxed);
            if current < best_count {
                best_count = current;
                best = Some(inst);
            }
        }

        let best = best?;
        if let Some(counter) = counts.get(&best.service_id) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        Some(best.clone())
    }

    fn select_weighted_round_robin(
        &self,
        service_name: &str,
        candidates: &[ServiceInstance],
    ) -> Option<ServiceInstance> {
        let mut weighted: Vec<ServiceInstance> = Vec::new();
        for inst in candidates {
            let weight = inst
                .metadata
                .get("weight")
                .and_then(|w| w.parse::<usize>().ok())
                .filter(|w| *w > 0)
                .unwrap_or(1);
            for _ in 0..weight {
                weighted.push(inst.clone());
            }
        }
        self.select_round_robin(&format!("{}-weighted", service_name), &weighted)
    }

    fn record_request(&self, service_name: &str, inst: &ServiceInstance) {
        let stats = self
            .stats
            .entry(inst.service_id.clone())
            .or_insert_with(|| Arc::new(ServiceStats::new(service_name)))
            .clone();
        stats.record_request(&inst.service_id);
    }
}

fn resolve_strategy(candidates: &[ServiceInstance]) -> Strategy {
    for inst in candidates {
        if let Some(name) = inst.metadata.get("lb_strategy") {
            if !name.is_empty() {
                return Strategy::parse(name);
            }
        }
    }
    Strategy::RoundRobin
}

fn select_ip_hash(candidates: &[ServiceInstance], ctx: &LbContext) -> Option<ServiceInstance> {
    let key = ctx
        .session_id
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| ctx.headers.get("X-Correlation-ID").cloned().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| format!("{:x}", rand::thread_rng().gen::<i64>()));

    let i = (fnv1a(&key) as usize) % candidates.len();
    Some(candidates[i].clone())
}

fn select_random(candidates: &[ServiceInstance]) -> Option<ServiceInstance> {
    let i = rand::thread_rng().gen_range(0..candidates.len());
    Some(candidates[i].clone())
}

/// FNV-1a 32-bit over the string's code points.
pub fn fnv1a(s: &str) -> u32 {
    const OFFSET_BASIS: u32 = 2166136261;
    const PRIME: u32 = 16777619;

    let mut h = OFFSET_BASIS;
    for c in s.chars() {
        h ^= c as u32;
        h = h.wrapping_mul(PRIME);
    }
    h
}
