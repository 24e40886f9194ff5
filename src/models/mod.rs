//! Domain models for licensing-service.

mod entitlement;
mod idempotency;
mod license;
mod ledger;
mod payment_method;
mod sku;
mod usage;
mod webhook;

pub use entitlement::{GrantEntitlement, LicenseEntitlement, ResolvedEntitlement};
pub use idempotency::IdempotencyToken;
pub use ledger::{AppendEntry, BillingInvoice, InvoiceStatus, LedgerEntry, LedgerEntryType};
pub use license::{LicenseStatus, TenantLicense};
pub use payment_method::PaymentMethod;
pub use sku::{BillingTerm, CatalogSku};
pub use usage::{RecordUsage, UsageMeter};
pub use webhook::{WebhookEvent, WebhookStatus};
