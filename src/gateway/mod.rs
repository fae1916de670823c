//! API Gateway - reverse proxy with dynamic catalog-based routing,
//! rate limiting, CORS, JWT auth, and resilience

pub mod middleware;
pub mod proxy;
pub mod routes;

use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::json;

use crate::config::GatewaySettings;
use crate::gateway::middleware::{CorsLayer, JwtAuthLayer, RateLimitLayer, RequestLoggingLayer};
use crate::gateway::proxy::{proxy_handler, Proxy};

/// Assemble the gateway router with its middleware stack.
///
/// Composition from outermost to innermost: request logging -> CORS ->
/// rate limit (if enabled) -> JWT -> health endpoint / proxy catch-all.
pub fn build_router(proxy: Arc<Proxy>, settings: &GatewaySettings) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .fallback(proxy_handler)
        .with_state(proxy)
        .layer(JwtAuthLayer::new(
            settings.jwt.clone(),
            vec!["/health".to_string()],
        ));

    if settings.rate_limit.enabled {
        app = app.layer(RateLimitLayer::new(
            settings.rate_limit.permit_limit,
            settings.rate_limit.window(),
        ));
    }

    app.layer(CorsLayer::new(settings.cors.clone()))
        .layer(RequestLoggingLayer::new())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "Healthy"}))
}
