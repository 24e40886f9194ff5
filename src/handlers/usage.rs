//! Usage metering endpoints.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::error::AppError;
use crate::middleware::tenant::TenantContext;
use crate::models::{RecordUsage, UsageMeter};
use crate::services::usage;

#[derive(Debug, Deserialize, Validate)]
pub struct RecordUsageRequest {
    #[validate(length(min = 1, max = 128))]
    pub meter_key: String,
    pub quantity: i64,
    pub unit: Option<String>,
    /// Explicit license to bind the meter to on first touch.
    pub license_id: Option<Uuid>,
    /// Bind the meter to the tenant's current license on first touch.
    /// Defaults to binding; callers opt out with `false`.
    #[serde(default = "default_attach_license")]
    pub attach_license: bool,
}

fn default_attach_license() -> bool {
    true
}

/// List the tenant's usage meters.
pub async fn list_meters(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<Vec<UsageMeter>>, AppError> {
    let meters = state.db.list_usage_meters(tenant.tenant_id).await?;
    Ok(Json(meters))
}

/// Record usage against a meter.
pub async fn record_usage(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<RecordUsageRequest>,
) -> Result<(StatusCode, Json<UsageMeter>), AppError> {
    payload.validate()?;

    let mut tx = state
        .db
        .pool()
        .begin()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e)))?;

    let meter = usage::record_usage(
        &mut *tx,
        &RecordUsage {
            tenant_id: tenant.tenant_id,
            meter_key: payload.meter_key,
            quantity: payload.quantity,
            unit: payload.unit,
            license_id: payload.license_id,
            attach_license: payload.attach_license,
        },
        Utc::now(),
    )
    .await?;

    tx.commit()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e)))?;

    Ok((StatusCode::OK, Json(meter)))
}
