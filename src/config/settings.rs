//! Settings for the three control plane processes
//!
//! Each process loads defaults, then an optional TOML file, then the
//! recognized environment variables.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use config::{Config, File};
use serde::{Deserialize, Serialize};

use crate::error::Result;

fn default_consul_address() -> String {
    "http://localhost:8500".to_string()
}

fn default_true() -> bool {
    true
}

/// Gateway process settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default = "default_consul_address")]
    pub consul_address: String,
    #[serde(default)]
    pub rabbitmq_url: Option<String>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

fn default_gateway_port() -> u16 {
    5000
}

/// Dynamic route table configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,
    #[serde(default = "default_refresh_secs")]
    pub refresh_interval_secs: u64,
}

fn default_route_prefix() -> String {
    "/api/".to_string()
}

fn default_refresh_secs() -> u64 {
    30
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            route_prefix: default_route_prefix(),
            refresh_interval_secs: default_refresh_secs(),
        }
    }
}

impl RoutingConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Per-client-IP rate limiting configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_permit_limit")]
    pub permit_limit: u32,
    #[serde(default = "default_window_secs")]
    pub window_seconds: u64,
}

fn default_permit_limit() -> u32 {
    100
}

fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            permit_limit: default_permit_limit(),
            window_seconds: default_window_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Cross-Origin Resource Sharing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub allow_any_origin: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default = "default_allowed_headers")]
    pub allowed_headers: Vec<String>,
}

fn default_allowed_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
        .map(String::from)
        .to_vec()
}

fn default_allowed_headers() -> Vec<String> {
    ["Authorization", "Content-Type"].map(String::from).to_vec()
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_any_origin: true,
            allowed_origins: Vec::new(),
            allowed_methods: default_allowed_methods(),
            allowed_headers: default_allowed_headers(),
        }
    }
}

/// JWT bearer token validation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JwtConfig {
    /// Empty secret disables authentication.
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default = "default_true")]
    pub validate_issuer: bool,
    #[serde(default = "default_true")]
    pub validate_audience: bool,
}

fn default_issuer() -> String {
    "LatticeMesh.Gateway".to_string()
}

fn default_audience() -> String {
    "LatticeMesh.Services".to_string()
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            issuer: default_issuer(),
            audience: default_audience(),
            validate_issuer: true,
            validate_audience: true,
        }
    }
}

/// Retry and circuit breaker configuration for the proxy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_backoff_exponent")]
    pub retry_backoff_exponent: f64,
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_max_ms: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_break_secs")]
    pub breaker_break_duration_secs: u64,
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_backoff_exponent() -> f64 {
    2.0
}

fn default_retry_jitter_ms() -> u64 {
    200
}

fn default_breaker_threshold() -> u32 {
    3
}

fn default_break_secs() -> u64 {
    20
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_backoff_exponent: default_backoff_exponent(),
            retry_jitter_max_ms: default_retry_jitter_ms(),
            breaker_failure_threshold: default_breaker_threshold(),
            breaker_break_duration_secs: default_break_secs(),
        }
    }
}

impl ResilienceConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_jitter_max(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_max_ms)
    }

    pub fn breaker_break_duration(&self) -> Duration {
        Duration::from_secs(self.breaker_break_duration_secs)
    }
}

impl GatewaySettings {
    /// Load settings from `config/gateway.toml` (optional) and the environment.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("config/gateway").required(false))
            .build()?;

        let mut settings: GatewaySettings = config.try_deserialize()?;
        settings.apply_env();
        Ok(settings)
    }

    /// Apply the recognized environment variables on top of current values.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<u16>("GATEWAY_PORT") {
            self.port = v;
        }
        if let Ok(v) = env::var("CONSUL_ADDRESS") {
            if !v.is_empty() {
                self.consul_address = v;
            }
        }
        if let Ok(v) = env::var("RABBITMQ_URL") {
            if !v.is_empty() {
                self.rabbitmq_url = Some(v);
            }
        }

        if let Ok(v) = env::var("GATEWAY_ROUTE_PREFIX") {
            if !v.is_empty() {
                self.routing.route_prefix = v;
            }
        }
        if let Some(v) = env_parse::<u64>("GATEWAY_ROUTE_REFRESH_SECONDS") {
            if v > 0 {
                self.routing.refresh_interval_secs = v;
            }
        }

        if env::var("GATEWAY_RATE_LIMIT_ENABLED").as_deref() == Ok("false") {
            self.rate_limit.enabled = false;
        }
        if let Some(v) = env_parse::<u32>("GATEWAY_RATE_LIMIT_PERMITS") {
            if v > 0 {
                self.rate_limit.permit_limit = v;
            }
        }
        if let Some(v) = env_parse::<u64>("GATEWAY_RATE_LIMIT_WINDOW_SECONDS") {
            if v > 0 {
                self.rate_limit.window_seconds = v;
            }
        }

        if env::var("GATEWAY_CORS_ALLOW_ANY_ORIGIN").as_deref() == Ok("false") {
            self.cors.allow_any_origin = false;
        }
        if let Ok(v) = env::var("GATEWAY_CORS_ALLOWED_ORIGINS") {
            if !v.is_empty() {
                self.cors.allowed_origins = split_comma(&v);
            }
        }

        if let Ok(v) = env::var("JWT_SECRET_KEY") {
            self.jwt.secret_key = v;
        }
        if let Ok(v) = env::var("JWT_ISSUER") {
            if !v.is_empty() {
                self.jwt.issuer = v;
            }
        }
        if let Ok(v) = env::var("JWT_AUDIENCE") {
            if !v.is_empty() {
                self.jwt.audience = v;
            }
        }

        if let Some(v) = env_parse::<u32>("GATEWAY_RETRY_COUNT") {
            self.resilience.retry_count = v;
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            consul_address: default_consul_address(),
            rabbitmq_url: None,
            routing: RoutingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cors: CorsConfig::default(),
            jwt: JwtConfig::default(),
            resilience: ResilienceConfig::default(),
        }
    }
}

/// Probe engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_tcp_timeout_secs")]
    pub tcp_timeout_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_http_timeout_secs() -> u64 {
    5
}

fn default_tcp_timeout_secs() -> u64 {
    3
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_threshold() -> u32 {
    2
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            tcp_timeout_secs: default_tcp_timeout_secs(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            http_headers: HashMap::new(),
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout_secs)
    }
}

/// Health Monitor process settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorSettings {
    #[serde(default = "default_monitor_port")]
    pub port: u16,
    #[serde(default = "default_consul_address")]
    pub consul_address: String,
    #[serde(default)]
    pub rabbitmq_url: Option<String>,
    #[serde(default)]
    pub probe: ProbeConfig,
}

fn default_monitor_port() -> u16 {
    8081
}

impl MonitorSettings {
    /// Load settings from `config/healthmonitor.toml` (optional) and the environment.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("config/healthmonitor").required(false))
            .build()?;

        let mut settings: MonitorSettings = config.try_deserialize()?;
        settings.apply_env();
        Ok(settings)
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<u16>("HEALTHMONITOR_PORT") {
            self.port = v;
        }
        if let Ok(v) = env::var("CONSUL_ADDRESS") {
            if !v.is_empty() {
                self.consul_address = v;
            }
        }
        if let Ok(v) = env::var("RABBITMQ_URL") {
            if !v.is_empty() {
                self.rabbitmq_url = Some(v);
            }
        }
        if let Some(v) = env_parse::<u64>("HEALTHMONITOR_PROBE_INTERVAL_SECONDS") {
            if v > 0 {
                self.probe.interval_secs = v;
            }
        }
        if let Some(v) = env_parse::<u64>("HEALTHMONITOR_HTTP_TIMEOUT_SECONDS") {
            if v > 0 {
                self.probe.http_timeout_secs = v;
            }
        }
        if let Some(v) = env_parse::<u64>("HEALTHMONITOR_TCP_TIMEOUT_SECONDS") {
            if v > 0 {
                self.probe.tcp_timeout_secs = v;
            }
        }
        if let Some(v) = env_parse::<u32>("HEALTHMONITOR_FAILURE_THRESHOLD") {
            if v > 0 {
                self.probe.failure_threshold = v;
            }
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            port: default_monitor_port(),
            consul_address: default_consul_address(),
            rabbitmq_url: None,
            probe: ProbeConfig::default(),
        }
    }
}

/// Discovery Registry process settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    #[serde(default = "default_consul_address")]
    pub consul_address: String,
    #[serde(default)]
    pub rabbitmq_url: Option<String>,
}

fn default_discovery_port() -> u16 {
    8080
}

impl DiscoverySettings {
    /// Load settings from `config/discovery.toml` (optional) and the environment.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("config/discovery").required(false))
            .build()?;

        let mut settings: DiscoverySettings = config.try_deserialize()?;
        settings.apply_env();
        Ok(settings)
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<u16>("DISCOVERY_PORT") {
            self.port = v;
        }
        if let Ok(v) = env::var("CONSUL_ADDRESS") {
            if !v.is_empty() {
                self.consul_address = v;
            }
        }
        if let Ok(v) = env::var("RABBITMQ_URL") {
            if !v.is_empty() {
                self.rabbitmq_url = Some(v);
            }
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            consul_address: default_consul_address(),
            rabbitmq_url: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok()?.parse().ok()
}

fn split_comma(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}
