//! Process settings and configuration management

mod settings;

pub use settings::{
    CorsConfig, DiscoverySettings, GatewaySettings, JwtConfig, MonitorSettings, ProbeConfig,
    RateLimitConfig, ResilienceConfig, RoutingConfig,
};
