//! Usage metering.
//!
//! One meter row per (tenant, meter_key). Meters are monotonic counters:
//! quantities only accumulate, there is no decrement or reset operation.

use crate::error::AppError;
use crate::models::{RecordUsage, UsageMeter};
use crate::services::lifecycle;
use crate::services::metrics::{DB_QUERY_DURATION, record_usage_operation};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

/// Record a usage quantity against a tenant meter, creating the meter row
/// on first touch.
///
/// License binding is sticky: the first recording that carries a license
/// (explicitly, or via `attach_license` through the tenant's current
/// license) pins the meter to it, and later recordings never rebind. A
/// zero quantity is a valid observation: it leaves `used_units` alone but
/// still advances `last_recorded_at`.
#[instrument(skip(conn, input), fields(tenant_id = %input.tenant_id, meter_key = %input.meter_key))]
pub async fn record_usage(
    conn: &mut PgConnection,
    input: &RecordUsage,
    now: DateTime<Utc>,
) -> Result<UsageMeter, AppError> {
    if input.quantity < 0 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Usage quantity must be non-negative, got {}",
            input.quantity
        )));
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["record_usage"])
        .start_timer();

    // Create the meter if this is the first touch. A concurrent creator
    // winning the race is fine; the UPDATE below folds both paths together.
    sqlx::query(
        r#"
        INSERT INTO usage_meters (meter_id, tenant_id, meter_key, unit)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (tenant_id, meter_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(input.tenant_id)
    .bind(&input.meter_key)
    .bind(&input.unit)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create usage meter: {}", e)))?;

    let meter = sqlx::query_as::<_, UsageMeter>(
        r#"
        SELECT meter_id, tenant_id, meter_key, unit, used_units, license_id, last_recorded_at, created_utc, updated_utc
        FROM usage_meters
        WHERE tenant_id = $1 AND meter_key = $2
        "#,
    )
    .bind(input.tenant_id)
    .bind(&input.meter_key)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load usage meter: {}", e)))?;

    // Work out the binding candidate only while the meter is unbound.
    let bind_license: Option<Uuid> = if meter.license_id.is_some() {
        None
    } else if let Some(license_id) = input.license_id {
        let license = lifecycle::fetch_license(conn, license_id).await?;
        if license.tenant_id != input.tenant_id {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "License {} not found",
                license_id
            )));
        }
        Some(license.license_id)
    } else if input.attach_license {
        lifecycle::current_license(conn, input.tenant_id)
            .await?
            .map(|l| l.license_id)
    } else {
        None
    };

    let meter = sqlx::query_as::<_, UsageMeter>(
        r#"
        UPDATE usage_meters
        SET used_units = used_units + $3,
            last_recorded_at = $4,
            license_id = COALESCE(license_id, $5),
            updated_utc = NOW()
        WHERE tenant_id = $1 AND meter_key = $2
        RETURNING meter_id, tenant_id, meter_key, unit, used_units, license_id, last_recorded_at, created_utc, updated_utc
        "#,
    )
    .bind(input.tenant_id)
    .bind(&input.meter_key)
    .bind(input.quantity)
    .bind(now)
    .bind(bind_license)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to record usage: {}", e)))?;

    timer.observe_duration();
    record_usage_operation(&input.tenant_id.to_string(), &input.meter_key);

    Ok(meter)
}
