//! Ledger and invoice read endpoints.
//!
//! The ledger has no direct write endpoint: CHARGE entries come from
//! purchases, and other entry types arrive through internal flows that call
//! the ledger service inside their own transactions.

use axum::Json;
use axum::extract::State;

use crate::AppState;
use crate::error::AppError;
use crate::middleware::tenant::TenantContext;
use crate::models::{BillingInvoice, LedgerEntry};

/// List the tenant's ledger entries, newest first.
pub async fn list_ledger_entries(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<Vec<LedgerEntry>>, AppError> {
    let entries = state.db.list_ledger_entries(tenant.tenant_id).await?;
    Ok(Json(entries))
}

/// List the tenant's invoices, newest first.
pub async fn list_invoices(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<Vec<BillingInvoice>>, AppError> {
    let invoices = state.db.list_invoices(tenant.tenant_id).await?;
    Ok(Json(invoices))
}
