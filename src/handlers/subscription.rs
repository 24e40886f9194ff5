//! Subscription lifecycle endpoints.
//!
//! Every mutating endpoint requires an idempotency key and runs the
//! lifecycle operation inside one transaction, so either all of its rows
//! (license, ledger entry, invoice, idempotency token) land or none do.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use validator::Validate;

use crate::AppState;
use crate::error::AppError;
use crate::middleware::tenant::TenantContext;
use crate::models::TenantLicense;
use crate::services::lifecycle::{self, ExpectedPrice, PurchaseOutcome, SweepSummary, TrialOutcome};

#[derive(Debug, Deserialize, Validate)]
pub struct StartTrialRequest {
    #[validate(length(min = 1, max = 64))]
    pub sku_code: String,
    #[validate(length(min = 1, max = 255))]
    pub idempotency_key: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PurchaseRequest {
    #[validate(length(min = 1, max = 64))]
    pub sku_code: String,
    #[validate(length(min = 1, max = 255))]
    pub idempotency_key: String,
    pub purchase_kind: Option<String>,
    pub expected_amount_cents: Option<i64>,
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CancelRequest {
    #[validate(length(min = 1, max = 255))]
    pub idempotency_key: String,
    /// Defaults to now, i.e. immediate cancellation.
    pub effective_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SweepRequest {
    /// Evaluation instant for the sweep; defaults to now.
    pub as_of: Option<DateTime<Utc>>,
}

/// Get the tenant's current license.
pub async fn get_current_license(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<TenantLicense>, AppError> {
    let mut conn = state
        .db
        .pool()
        .acquire()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to acquire connection: {}", e)))?;

    let license = lifecycle::current_license(&mut *conn, tenant.tenant_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No active or trialing license")))?;

    Ok(Json(license))
}

/// Start a trial.
pub async fn start_trial(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<StartTrialRequest>,
) -> Result<(StatusCode, Json<TrialOutcome>), AppError> {
    payload.validate()?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        sku_code = %payload.sku_code,
        "Starting trial"
    );

    let mut tx = state
        .db
        .pool()
        .begin()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e)))?;

    let outcome = state
        .lifecycle
        .start_trial(
            &mut *tx,
            tenant.tenant_id,
            &payload.sku_code,
            &payload.idempotency_key,
        )
        .await?;

    tx.commit()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e)))?;

    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

/// Purchase a SKU.
pub async fn purchase(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<PurchaseRequest>,
) -> Result<(StatusCode, Json<PurchaseOutcome>), AppError> {
    payload.validate()?;

    let expected = match (payload.expected_amount_cents, &payload.currency) {
        (Some(amount_cents), Some(currency)) => Some(ExpectedPrice {
            amount_cents,
            currency: currency.clone(),
        }),
        (None, None) => None,
        _ => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "expected_amount_cents and currency must be provided together"
            )));
        }
    };

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        sku_code = %payload.sku_code,
        "Processing purchase"
    );

    let mut tx = state
        .db
        .pool()
        .begin()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e)))?;

    let outcome = state
        .lifecycle
        .purchase(
            &mut *tx,
            tenant.tenant_id,
            &payload.sku_code,
            &payload.idempotency_key,
            payload.purchase_kind.as_deref(),
            expected,
        )
        .await?;

    tx.commit()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e)))?;

    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

/// Cancel the current license.
pub async fn cancel(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<TenantLicense>, AppError> {
    payload.validate()?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        effective_date = ?payload.effective_date,
        "Processing cancellation"
    );

    let mut tx = state
        .db
        .pool()
        .begin()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e)))?;

    let cancelled = state
        .lifecycle
        .cancel(
            &mut *tx,
            tenant.tenant_id,
            payload.effective_date,
            &payload.idempotency_key,
        )
        .await?;

    tx.commit()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e)))?;

    cancelled
        .map(Json)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No active or trialing license to cancel")))
}

/// Run the billing sweep: trial conversion/expiry, period rollover,
/// grace lock-outs and usage threshold alerts.
pub async fn sweep(
    State(state): State<AppState>,
    Json(payload): Json<SweepRequest>,
) -> Result<Json<SweepSummary>, AppError> {
    let as_of = payload.as_of.unwrap_or_else(Utc::now);

    let mut tx = state
        .db
        .pool()
        .begin()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e)))?;

    let summary = state.lifecycle.roll_periods_and_alert(&mut *tx, as_of).await?;

    tx.commit()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e)))?;

    Ok(Json(summary))
}
