//! Usage meter model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Per-tenant, per-metric usage counter.
///
/// `used_units` only ever increases within a measurement epoch. The license
/// binding is first-touch and sticky: once set it is never re-evaluated,
/// even if the tenant's subscription changes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageMeter {
    pub meter_id: Uuid,
    pub tenant_id: Uuid,
    pub meter_key: String,
    pub unit: Option<String>,
    pub used_units: i64,
    pub license_id: Option<Uuid>,
    pub last_recorded_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for recording usage against a meter.
#[derive(Debug, Clone)]
pub struct RecordUsage {
    pub tenant_id: Uuid,
    pub meter_key: String,
    pub quantity: i64,
    pub unit: Option<String>,
    pub license_id: Option<Uuid>,
    pub attach_license: bool,
}
