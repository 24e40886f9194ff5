//! Idempotency registry.
//!
//! Dedupes mutating operations keyed by (scope, client key). The first
//! writer wins; a replay with an identical payload hash returns the stored
//! token, a replay with a different hash is a conflict. The unique
//! constraint on (scope, idempotency_key) is the actual concurrency guard:
//! a lost insert race is re-read and treated as "someone else already did
//! this".

use crate::error::AppError;
use crate::models::IdempotencyToken;
use crate::services::metrics::DB_QUERY_DURATION;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

/// Outcome of registering a mutating operation.
#[derive(Debug, Clone)]
pub enum Registration {
    /// First occurrence; the caller must perform the operation and attach
    /// the created entity to the token before committing.
    Fresh(IdempotencyToken),
    /// Same key, same payload: the caller must return the original result
    /// without redoing side effects.
    Replay(IdempotencyToken),
}

/// Stable, order-independent hash of a JSON payload: SHA-256 over a
/// canonical serialization with object keys sorted.
pub fn payload_hash(payload: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(payload, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Canonical JSON text of a payload (sorted object keys, compact).
pub fn canonical_json(payload: &Value) -> String {
    let mut out = String::new();
    write_canonical(payload, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Register a mutating operation under (scope, key).
#[instrument(skip(conn, payload), fields(scope = %scope, key = %key))]
pub async fn register(
    conn: &mut PgConnection,
    scope: &str,
    key: &str,
    payload: &Value,
) -> Result<Registration, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["idempotency_register"])
        .start_timer();

    let hash = payload_hash(payload);

    if let Some(existing) = fetch(conn, scope, key).await? {
        timer.observe_duration();
        return replay_or_conflict(existing, &hash);
    }

    let token_id = Uuid::new_v4();
    let inserted = sqlx::query_as::<_, IdempotencyToken>(
        r#"
        INSERT INTO idempotency_keys (token_id, scope, idempotency_key, payload_hash)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (scope, idempotency_key) DO NOTHING
        RETURNING token_id, scope, idempotency_key, payload_hash, entity_id, created_utc
        "#,
    )
    .bind(token_id)
    .bind(scope)
    .bind(key)
    .bind(&hash)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to register idempotency key: {}", e)))?;

    timer.observe_duration();

    match inserted {
        Some(token) => Ok(Registration::Fresh(token)),
        None => {
            // Lost the insert race: another request registered the key first.
            let existing = fetch(conn, scope, key).await?.ok_or_else(|| {
                AppError::DatabaseError(anyhow::anyhow!("Idempotency key vanished after conflict"))
            })?;
            replay_or_conflict(existing, &hash)
        }
    }
}

/// Attach the entity created by the original operation to its token.
#[instrument(skip(conn))]
pub async fn attach_entity(
    conn: &mut PgConnection,
    token_id: Uuid,
    entity_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query("UPDATE idempotency_keys SET entity_id = $2 WHERE token_id = $1")
        .bind(token_id)
        .bind(entity_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to attach entity: {}", e)))?;
    Ok(())
}

async fn fetch(
    conn: &mut PgConnection,
    scope: &str,
    key: &str,
) -> Result<Option<IdempotencyToken>, AppError> {
    sqlx::query_as::<_, IdempotencyToken>(
        r#"
        SELECT token_id, scope, idempotency_key, payload_hash, entity_id, created_utc
        FROM idempotency_keys
        WHERE scope = $1 AND idempotency_key = $2
        "#,
    )
    .bind(scope)
    .bind(key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to fetch idempotency key: {}", e)))
}

fn replay_or_conflict(existing: IdempotencyToken, hash: &str) -> Result<Registration, AppError> {
    if existing.payload_hash == hash {
        Ok(Registration::Replay(existing))
    } else {
        Err(AppError::IdempotencyConflict(anyhow::anyhow!(
            "Key '{}' in scope '{}' was already used with a different payload",
            existing.idempotency_key,
            existing.scope
        )))
    }
}
