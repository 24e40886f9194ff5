//! License entitlement models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A named capability/limit granted by a license.
///
/// `limit_units` and `is_unlimited` are mutually exclusive: an unlimited
/// grant carries no numeric limit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LicenseEntitlement {
    pub entitlement_id: Uuid,
    pub license_id: Uuid,
    pub key: String,
    pub limit_units: Option<i64>,
    pub is_unlimited: bool,
    pub unit: Option<String>,
    pub description: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// The single strongest grant for one entitlement key across a tenant's
/// active licenses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntitlement {
    pub key: String,
    pub license_id: Uuid,
    pub limit_units: Option<i64>,
    pub is_unlimited: bool,
    pub unit: Option<String>,
}

/// Input for granting (creating or updating) an entitlement on a license.
#[derive(Debug, Clone)]
pub struct GrantEntitlement {
    pub license_id: Uuid,
    pub key: String,
    pub limit_units: Option<i64>,
    pub is_unlimited: bool,
    pub unit: Option<String>,
    pub description: Option<String>,
}
