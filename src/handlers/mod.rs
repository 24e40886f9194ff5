//! HTTP handlers.

pub mod catalog;
pub mod entitlements;
pub mod ledger;
pub mod payment_methods;
pub mod subscription;
pub mod usage;
pub mod webhooks;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::AppError;
use crate::services::metrics;

/// Liveness probe.
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "licensing-service" }))
}

/// Readiness probe: verifies the database is reachable.
pub async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    state
        .db
        .health_check()
        .await
        .map_err(|_| AppError::ServiceUnavailable)?;
    Ok(Json(json!({ "status": "ready", "service": "licensing-service" })))
}

/// Prometheus metrics in text exposition format.
pub async fn metrics_handler() -> (StatusCode, String) {
    (StatusCode::OK, metrics::get_metrics())
}
