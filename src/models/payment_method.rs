//! Payment method model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A tenant's stored payment instrument reference. At most one row per
/// tenant carries `is_default`; setting a new default clears prior ones in
/// the same transaction.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentMethod {
    pub payment_method_id: Uuid,
    pub tenant_id: Uuid,
    pub provider: String,
    pub external_ref: String,
    pub is_default: bool,
    pub created_utc: DateTime<Utc>,
}
