//! Append-only billing ledger.
//!
//! Replay semantics are ledger-specific: a retried append with identical
//! (amount, currency, entry_type, license_id) returns the existing row, any
//! difference under the same key is a conflict. No update or delete
//! operation exists on this entity.

use crate::error::AppError;
use crate::models::{AppendEntry, LedgerEntry};
use crate::services::metrics::{DB_QUERY_DURATION, record_ledger_entry};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

/// Append a monetary event, idempotently per (tenant, idempotency_key).
#[instrument(skip(conn, input), fields(tenant_id = %input.tenant_id, entry_type = %input.entry_type.as_str()))]
pub async fn append(conn: &mut PgConnection, input: &AppendEntry) -> Result<LedgerEntry, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["ledger_append"])
        .start_timer();

    if let Some(existing) = fetch_by_key(conn, input.tenant_id, &input.idempotency_key).await? {
        timer.observe_duration();
        return replay_or_conflict(existing, input);
    }

    let entry_id = Uuid::new_v4();
    let inserted = sqlx::query_as::<_, LedgerEntry>(
        r#"
        INSERT INTO ledger_entries (entry_id, tenant_id, license_id, amount_cents, currency, entry_type, description, idempotency_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
        RETURNING entry_id, tenant_id, license_id, amount_cents, currency, entry_type, description, idempotency_key, recorded_at
        "#,
    )
    .bind(entry_id)
    .bind(input.tenant_id)
    .bind(input.license_id)
    .bind(input.amount_cents)
    .bind(&input.currency)
    .bind(input.entry_type.as_str())
    .bind(&input.description)
    .bind(&input.idempotency_key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to append ledger entry: {}", e)))?;

    timer.observe_duration();

    match inserted {
        Some(entry) => {
            record_ledger_entry(&input.tenant_id.to_string(), input.entry_type.as_str());
            Ok(entry)
        }
        None => {
            // Concurrent identical request won the insert.
            let existing = fetch_by_key(conn, input.tenant_id, &input.idempotency_key)
                .await?
                .ok_or_else(|| {
                    AppError::DatabaseError(anyhow::anyhow!("Ledger entry vanished after conflict"))
                })?;
            replay_or_conflict(existing, input)
        }
    }
}

async fn fetch_by_key(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    idempotency_key: &str,
) -> Result<Option<LedgerEntry>, AppError> {
    sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT entry_id, tenant_id, license_id, amount_cents, currency, entry_type, description, idempotency_key, recorded_at
        FROM ledger_entries
        WHERE tenant_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(tenant_id)
    .bind(idempotency_key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to fetch ledger entry: {}", e)))
}

fn replay_or_conflict(existing: LedgerEntry, input: &AppendEntry) -> Result<LedgerEntry, AppError> {
    let matches = existing.amount_cents == input.amount_cents
        && existing.currency == input.currency
        && existing.entry_type == input.entry_type.as_str()
        && existing.license_id == input.license_id;

    if matches {
        Ok(existing)
    } else {
        Err(AppError::IdempotencyConflict(anyhow::anyhow!(
            "Ledger key '{}' was already used for a different entry",
            input.idempotency_key
        )))
    }
}
