//! Dynamic route table refreshed from the service catalog

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::catalog::{Catalog, HealthStatus};
use crate::config::RoutingConfig;

/// A single healthy service instance that can receive traffic
#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    pub service_id: String,
    /// Full URL: `scheme://host:port`
    pub address: String,
}

/// Backends for a single service
#[derive(Debug, Clone)]
pub struct ServiceRoute {
    pub service_name: String,
    pub backends: Vec<Backend>,
}

/// Dynamic mapping of service names to healthy backends, refreshed
/// periodically from the catalog. The map is swapped atomically so readers
/// never observe a half-built table.
pub struct RouteTable {
    catalog: Arc<dyn Catalog>,
    config: RoutingConfig,
    routes: RwLock<HashMap<String, ServiceRoute>>,
}

impl RouteTable {
    pub fn new(catalog: Arc<dyn Catalog>, config: RoutingConfig) -> Self {
        Self {
            catalog,
            config,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Run the refresh loop: once immediately, then per interval, until the
    /// shutdown signal fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("route table refresh loop stopping");
                    return;
                }
                _ = ticker.tick() => self.refresh().await,
            }
        }
    }

    /// A random healthy backend for the given service name, or None.
    pub fn lookup(&self, service_name: &str) -> Option<Backend> {
        let routes = self.routes.read();
        let route = routes.get(&service_name.to_lowercase())?;
        if route.backends.is_empty() {
            return None;
        }

        let i = rand::thread_rng().gen_range(0..route.backends.len());
        Some(route.backends[i].clone())
    }

    /// Canonical names of all currently routed services.
    pub fn services(&self) -> Vec<String> {
        self.routes
            .read()
            .values()
            .map(|route| route.service_name.clone())
            .collect()
    }

    /// The normalized route prefix (e.g. `/api/`).
    pub fn prefix(&self) -> String {
        normalize_prefix(&self.config.route_prefix)
    }

    /// Rebuild the route map from the catalog. Failures leave the current
    /// map untouched.
    pub async fn refresh(&self) {
        let services = match self.catalog.services().await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to list services from catalog");
                return;
            }
        };

        let mut new_routes = HashMap::with_capacity(services.len());

        for service_name in services {
            if service_name.eq_ignore_ascii_case("consul") {
                continue;
            }

            let instances = match self.catalog.instances(&service_name).await {
                Ok(i) => i,
                Err(e) => {
                    error!(service = %service_name, error = %e, "failed to get instances");
                    continue;
                }
            };

            let backends: Vec<Backend> = instances
                .iter()
                .filter(|inst| inst.status == HealthStatus::Healthy)
                .map(|inst| Backend {
                    service_id: inst.service_id.clone(),
                    address: format!("{}://{}:{}", inst.scheme(), inst.address, inst.port),
                })
                .collect();

            if backends.is_empty() {
                warn!(service = %service_name, "no healthy instances");
                continue;
            }

            new_routes.insert(
                service_name.to_lowercase(),
                ServiceRoute {
                    service_name,
                    backends,
                },
            );
        }

        let count = new_routes.len();
        *self.routes.write() = new_routes;

        info!(services = count, "route table refreshed");
    }
}

/// Ensure the prefix starts and ends with `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    if !prefix.starts_with('/') {
        out.push('/');
    }
    out.push_str(prefix);
    if !out.ends_with('/') {
        out.push('/');
    }
    out
}

/// Extract the service name from a request path given a prefix.
///
/// With prefix `/api/` and path `/api/my-service/foo/bar`, returns
/// `("my-service", "/foo/bar")`. The remainder always starts with `/`.
pub fn parse_service_from_path(prefix: &str, path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        return None;
    }

    match rest.find('/') {
        Some(idx) => Some((rest[..idx].to_string(), rest[idx..].to_string())),
        None => Some((rest.to_string(), "/".to_string())),
    }
}

/// Construct the full backend URL for a request.
pub fn build_backend_url(backend_addr: &str, remainder: &str, raw_query: Option<&str>) -> String {
    let mut url = format!("{}{}", backend_addr, remainder);
    if let Some(q) = raw_query {
        if !q.is_empty() {
            url.push('?');
            url.push_str(q);
        }
    }
    url
}
