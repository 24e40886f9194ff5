//! Idempotency registry token model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// First-writer-wins registration of a mutating operation. `entity_id`
/// points at the row the original call created, so replays can return the
/// original result without redoing side effects.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IdempotencyToken {
    pub token_id: Uuid,
    pub scope: String,
    pub idempotency_key: String,
    pub payload_hash: String,
    pub entity_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}
