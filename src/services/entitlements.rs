//! Entitlement resolution: the single strongest active grant per key.
//!
//! "Most generous wins" across possibly-overlapping licenses: an unlimited
//! grant wins a key outright and is never displaced; between numeric grants
//! the larger limit wins; ties keep the first seen (licenses are folded in
//! creation order, so the resolution is deterministic).

use crate::error::AppError;
use crate::models::{GrantEntitlement, LicenseEntitlement, ResolvedEntitlement, TenantLicense};
use crate::services::lifecycle::license_is_active;
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

/// Fixed cross-unit multipliers: a meter tracked in `from` units is
/// multiplied by this factor to compare against an entitlement expressed in
/// `to` units. Unknown pairs fall back to 1 (no conversion).
const UNIT_CONVERSIONS: &[(&str, &str, f64)] = &[
    ("kilobytes", "megabytes", 1.0 / 1024.0),
    ("megabytes", "kilobytes", 1024.0),
    ("megabytes", "gigabytes", 1.0 / 1024.0),
    ("gigabytes", "megabytes", 1024.0),
    ("gigabytes", "terabytes", 1.0 / 1024.0),
    ("terabytes", "gigabytes", 1024.0),
];

/// Multiplier converting a quantity in `from` units into `to` units.
pub fn unit_multiplier(from: Option<&str>, to: Option<&str>) -> f64 {
    match (from, to) {
        (Some(f), Some(t)) if f != t => UNIT_CONVERSIONS
            .iter()
            .find(|(cf, ct, _)| *cf == f && *ct == t)
            .map(|(_, _, m)| *m)
            .unwrap_or(1.0),
        _ => 1.0,
    }
}

/// Fold entitlement rows into the strongest grant per key.
pub fn resolve_rows(
    rows: impl IntoIterator<Item = LicenseEntitlement>,
) -> HashMap<String, ResolvedEntitlement> {
    let mut resolved: HashMap<String, ResolvedEntitlement> = HashMap::new();

    for row in rows {
        let candidate = ResolvedEntitlement {
            key: row.key.clone(),
            license_id: row.license_id,
            limit_units: if row.is_unlimited { None } else { row.limit_units },
            is_unlimited: row.is_unlimited,
            unit: row.unit.clone(),
        };

        match resolved.get(&row.key) {
            None => {
                resolved.insert(row.key, candidate);
            }
            Some(current) => {
                if current.is_unlimited {
                    // Unlimited is never displaced.
                    continue;
                }
                if candidate.is_unlimited
                    || candidate.limit_units.unwrap_or(0) > current.limit_units.unwrap_or(0)
                {
                    resolved.insert(row.key, candidate);
                }
            }
        }
    }

    resolved
}

/// Resolve the tenant's entitlements across all licenses active at `as_of`.
#[instrument(skip(conn), fields(tenant_id = %tenant_id))]
pub async fn resolve(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    as_of: DateTime<Utc>,
) -> Result<HashMap<String, ResolvedEntitlement>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["resolve_entitlements"])
        .start_timer();

    let licenses = sqlx::query_as::<_, TenantLicense>(
        r#"
        SELECT license_id, tenant_id, sku_id, sku_code, term, status, amount_cents, currency,
               trial_started_at, trial_ends_at, trial_grace_expires_at, is_read_only,
               current_period_start, current_period_end, canceled_at, created_utc, updated_utc
        FROM tenant_licenses
        WHERE tenant_id = $1 AND status <> 'cancelled'
        ORDER BY created_utc
        "#,
    )
    .bind(tenant_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load licenses: {}", e)))?;

    let active_ids: Vec<Uuid> = licenses
        .iter()
        .filter(|l| license_is_active(l, as_of))
        .map(|l| l.license_id)
        .collect();

    if active_ids.is_empty() {
        timer.observe_duration();
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, LicenseEntitlement>(
        r#"
        SELECT e.entitlement_id, e.license_id, e.key, e.limit_units, e.is_unlimited, e.unit, e.description, e.created_utc, e.updated_utc
        FROM license_entitlements e
        JOIN tenant_licenses l ON e.license_id = l.license_id
        WHERE e.license_id = ANY($1)
        ORDER BY l.created_utc, e.created_utc
        "#,
    )
    .bind(&active_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load entitlements: {}", e)))?;

    timer.observe_duration();

    Ok(resolve_rows(rows))
}

/// Grant (create or update) an entitlement on a license.
#[instrument(skip(conn, input), fields(license_id = %input.license_id, key = %input.key))]
pub async fn grant(
    conn: &mut PgConnection,
    input: &GrantEntitlement,
) -> Result<LicenseEntitlement, AppError> {
    if input.is_unlimited && input.limit_units.is_some() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "An unlimited grant must not carry a numeric limit"
        )));
    }
    if !input.is_unlimited && input.limit_units.is_none() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "A numeric grant requires limit_units"
        )));
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["grant_entitlement"])
        .start_timer();

    let entitlement = sqlx::query_as::<_, LicenseEntitlement>(
        r#"
        INSERT INTO license_entitlements (entitlement_id, license_id, key, limit_units, is_unlimited, unit, description)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (license_id, key) DO UPDATE
        SET limit_units = EXCLUDED.limit_units,
            is_unlimited = EXCLUDED.is_unlimited,
            unit = EXCLUDED.unit,
            description = EXCLUDED.description,
            updated_utc = NOW()
        RETURNING entitlement_id, license_id, key, limit_units, is_unlimited, unit, description, created_utc, updated_utc
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(input.license_id)
    .bind(&input.key)
    .bind(input.limit_units)
    .bind(input.is_unlimited)
    .bind(&input.unit)
    .bind(&input.description)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to grant entitlement: {}", e)))?;

    timer.observe_duration();

    Ok(entitlement)
}

/// Revoke an entitlement from a license.
#[instrument(skip(conn), fields(license_id = %license_id, key = %key))]
pub async fn revoke(
    conn: &mut PgConnection,
    license_id: Uuid,
    key: &str,
) -> Result<LicenseEntitlement, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["revoke_entitlement"])
        .start_timer();

    let removed = sqlx::query_as::<_, LicenseEntitlement>(
        r#"
        DELETE FROM license_entitlements
        WHERE license_id = $1 AND key = $2
        RETURNING entitlement_id, license_id, key, limit_units, is_unlimited, unit, description, created_utc, updated_utc
        "#,
    )
    .bind(license_id)
    .bind(key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to revoke entitlement: {}", e)))?;

    timer.observe_duration();

    removed.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!(
            "No entitlement '{}' on license {}",
            key,
            license_id
        ))
    })
}
