//! Entitlement endpoints.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::error::AppError;
use crate::middleware::tenant::TenantContext;
use crate::models::{GrantEntitlement, LicenseEntitlement, ResolvedEntitlement};
use crate::services::{entitlements, lifecycle};

#[derive(Debug, Deserialize, Default)]
pub struct ResolveQuery {
    /// Evaluation instant; defaults to now.
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct GrantRequest {
    #[validate(length(min = 1, max = 128))]
    pub key: String,
    pub limit_units: Option<i64>,
    #[serde(default)]
    pub is_unlimited: bool,
    pub unit: Option<String>,
    pub description: Option<String>,
}

/// Resolve the tenant's effective entitlements across all active licenses.
pub async fn resolve(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<Vec<ResolvedEntitlement>>, AppError> {
    let as_of = query.as_of.unwrap_or_else(Utc::now);

    let mut conn = state
        .db
        .pool()
        .acquire()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to acquire connection: {}", e)))?;

    let resolved = entitlements::resolve(&mut *conn, tenant.tenant_id, as_of).await?;

    let mut list: Vec<ResolvedEntitlement> = resolved.into_values().collect();
    list.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(Json(list))
}

/// Grant (create or update) an entitlement on a license.
pub async fn grant(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(license_id): Path<Uuid>,
    Json(payload): Json<GrantRequest>,
) -> Result<(StatusCode, Json<LicenseEntitlement>), AppError> {
    payload.validate()?;

    let mut tx = state
        .db
        .pool()
        .begin()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e)))?;

    // The license must exist and belong to the caller's tenant.
    let license = lifecycle::fetch_license(&mut *tx, license_id).await?;
    if license.tenant_id != tenant.tenant_id {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "License {} not found",
            license_id
        )));
    }

    let entitlement = entitlements::grant(
        &mut *tx,
        &GrantEntitlement {
            license_id,
            key: payload.key,
            limit_units: payload.limit_units,
            is_unlimited: payload.is_unlimited,
            unit: payload.unit,
            description: payload.description,
        },
    )
    .await?;

    tx.commit()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e)))?;

    if let Err(e) = state
        .audit
        .record(
            Some(tenant.tenant_id),
            "ENTITLEMENT_GRANTED",
            serde_json::json!({
                "license_id": license_id,
                "key": entitlement.key,
                "limit_units": entitlement.limit_units,
                "is_unlimited": entitlement.is_unlimited,
            }),
        )
        .await
    {
        tracing::warn!(error = %e, "Audit write failed for entitlement grant");
    }

    Ok((StatusCode::CREATED, Json(entitlement)))
}

/// Revoke an entitlement from a license.
pub async fn revoke(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path((license_id, key)): Path<(Uuid, String)>,
) -> Result<StatusCode, AppError> {
    let mut tx = state
        .db
        .pool()
        .begin()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e)))?;

    let license = lifecycle::fetch_license(&mut *tx, license_id).await?;
    if license.tenant_id != tenant.tenant_id {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "License {} not found",
            license_id
        )));
    }

    entitlements::revoke(&mut *tx, license_id, &key).await?;

    tx.commit()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e)))?;

    if let Err(e) = state
        .audit
        .record(
            Some(tenant.tenant_id),
            "ENTITLEMENT_REVOKED",
            serde_json::json!({ "license_id": license_id, "key": key }),
        )
        .await
    {
        tracing::warn!(error = %e, "Audit write failed for entitlement revoke");
    }

    Ok(StatusCode::NO_CONTENT)
}
