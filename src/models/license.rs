//! Tenant license model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::BillingTerm;

/// License lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Trialing,
    Active,
    Expired,
    Cancelled,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseStatus::Trialing => "trialing",
            LicenseStatus::Active => "active",
            LicenseStatus::Expired => "expired",
            LicenseStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "trialing" => LicenseStatus::Trialing,
            "expired" => LicenseStatus::Expired,
            "cancelled" => LicenseStatus::Cancelled,
            _ => LicenseStatus::Active,
        }
    }
}

/// A tenant's subscription to one catalog SKU for one billing period.
///
/// At most one license per tenant is normally ACTIVE/TRIALING; purchase
/// forcibly cancels prior ones. `is_read_only` is deliberately a separate
/// flag from `status`: an EXPIRED license inside its grace window still
/// grants read access until the sweep flips the flag.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TenantLicense {
    pub license_id: Uuid,
    pub tenant_id: Uuid,
    pub sku_id: Uuid,
    pub sku_code: String,
    pub term: String,
    pub status: String,
    pub amount_cents: i64,
    pub currency: String,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub trial_grace_expires_at: Option<DateTime<Utc>>,
    pub is_read_only: bool,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl TenantLicense {
    pub fn parsed_status(&self) -> LicenseStatus {
        LicenseStatus::from_string(&self.status)
    }

    pub fn parsed_term(&self) -> BillingTerm {
        BillingTerm::from_string(&self.term)
    }
}
