//! Catalog SKU model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing term for a SKU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingTerm {
    Monthly,
    BiAnnual,
    Annual,
}

impl BillingTerm {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingTerm::Monthly => "monthly",
            BillingTerm::BiAnnual => "bi_annual",
            BillingTerm::Annual => "annual",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "bi_annual" => BillingTerm::BiAnnual,
            "annual" => BillingTerm::Annual,
            _ => BillingTerm::Monthly,
        }
    }
}

/// Purchasable catalog SKU. Price fields are copied onto the license at
/// purchase time; a SKU row is never re-read to price an existing license.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CatalogSku {
    pub sku_id: Uuid,
    pub code: String,
    pub name: String,
    pub term: String,
    pub trial_days: i32,
    pub amount_cents: i64,
    pub currency: String,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl CatalogSku {
    pub fn parsed_term(&self) -> BillingTerm {
        BillingTerm::from_string(&self.term)
    }
}
