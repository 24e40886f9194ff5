//! Best-effort billing audit sink.
//!
//! Writes on its own pool connection so a failed audit insert never touches
//! the caller's transaction. The contract is explicit: `record` returns a
//! `Result` and call sites log the error and continue; audit failures must
//! never abort the primary billing operation.

use crate::error::AppError;
use sqlx::postgres::PgPool;
use tracing::instrument;
use uuid::Uuid;

#[derive(Clone)]
pub struct AuditSink {
    pool: PgPool,
}

impl AuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record one audit event.
    #[instrument(skip(self, detail), fields(event_type = %event_type))]
    pub async fn record(
        &self,
        tenant_id: Option<Uuid>,
        event_type: &str,
        detail: serde_json::Value,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO billing_audit_events (audit_id, tenant_id, event_type, detail)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(event_type)
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to write audit event: {}", e)))?;

        Ok(())
    }
}
