//! Ledger entry and invoice models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Monetary event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Charge,
    Refund,
    Credit,
    Adjustment,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::Charge => "charge",
            LedgerEntryType::Refund => "refund",
            LedgerEntryType::Credit => "credit",
            LedgerEntryType::Adjustment => "adjustment",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "refund" => LedgerEntryType::Refund,
            "credit" => LedgerEntryType::Credit,
            "adjustment" => LedgerEntryType::Adjustment,
            _ => LedgerEntryType::Charge,
        }
    }
}

/// Append-only monetary event. Never mutated or deleted after creation;
/// (tenant_id, idempotency_key) is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub tenant_id: Uuid,
    pub license_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: String,
    pub entry_type: String,
    pub description: Option<String>,
    pub idempotency_key: String,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn parsed_entry_type(&self) -> LedgerEntryType {
        LedgerEntryType::from_string(&self.entry_type)
    }
}

/// Input for appending a ledger entry.
#[derive(Debug, Clone)]
pub struct AppendEntry {
    pub tenant_id: Uuid,
    pub license_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: String,
    pub entry_type: LedgerEntryType,
    pub idempotency_key: String,
    pub description: Option<String>,
}

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "paid" => InvoiceStatus::Paid,
            _ => InvoiceStatus::Pending,
        }
    }
}

/// Invoice derived from a purchase ledger entry (exactly one per entry).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingInvoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub license_id: Uuid,
    pub ledger_entry_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub issued_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl BillingInvoice {
    pub fn parsed_status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }
}
