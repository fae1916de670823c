//! HTTP status surface for the Health Monitor

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::monitor::cache::StatusCache;

/// Build the Health Monitor HTTP router.
pub fn router(cache: Arc<StatusCache>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(all_status))
        .route("/api/status/{serviceName}", get(service_status))
        .with_state(cache)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "Healthy"}))
}

async fn all_status(State(cache): State<Arc<StatusCache>>) -> Json<serde_json::Value> {
    Json(json!(cache.get_all()))
}

async fn service_status(
    State(cache): State<Arc<StatusCache>>,
    Path(service_name): Path<String>,
) -> Json<serde_json::Value> {
    Json(json!(cache.get_by_service(&service_name)))
}
