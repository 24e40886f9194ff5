//! Payment method endpoints.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::error::AppError;
use crate::middleware::tenant::TenantContext;
use crate::models::PaymentMethod;
use crate::services::payment_methods::{self, AddPaymentMethod};

#[derive(Debug, Deserialize, Validate)]
pub struct AddPaymentMethodRequest {
    #[validate(length(min = 1, max = 64))]
    pub provider: String,
    #[validate(length(min = 1, max = 255))]
    pub external_ref: String,
    #[serde(default)]
    pub is_default: bool,
    #[validate(length(min = 1, max = 255))]
    pub idempotency_key: String,
}

/// List the tenant's payment methods, default first.
pub async fn list_payment_methods(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<Vec<PaymentMethod>>, AppError> {
    let methods = state.db.list_payment_methods(tenant.tenant_id).await?;
    Ok(Json(methods))
}

/// Attach a payment method.
pub async fn add_payment_method(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<AddPaymentMethodRequest>,
) -> Result<(StatusCode, Json<PaymentMethod>), AppError> {
    payload.validate()?;

    let mut tx = state
        .db
        .pool()
        .begin()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e)))?;

    let method = payment_methods::add(
        &mut *tx,
        &AddPaymentMethod {
            tenant_id: tenant.tenant_id,
            provider: payload.provider,
            external_ref: payload.external_ref,
            is_default: payload.is_default,
        },
        &payload.idempotency_key,
    )
    .await?;

    tx.commit()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e)))?;

    Ok((StatusCode::CREATED, Json(method)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RemovePaymentMethodQuery {
    #[validate(length(min = 1, max = 255))]
    pub idempotency_key: String,
}

/// Detach a payment method.
pub async fn remove_payment_method(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(payment_method_id): Path<Uuid>,
    Query(query): Query<RemovePaymentMethodQuery>,
) -> Result<StatusCode, AppError> {
    query.validate()?;

    let mut tx = state
        .db
        .pool()
        .begin()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e)))?;

    payment_methods::remove(
        &mut *tx,
        tenant.tenant_id,
        payment_method_id,
        &query.idempotency_key,
    )
    .await?;

    tx.commit()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e)))?;

    Ok(StatusCode::NO_CONTENT)
}
