//! Database service for licensing-service.
//!
//! Holds the connection pool plus the pool-level read queries behind the GET
//! surface. Mutating core operations live in their own service modules and
//! take an explicit `&mut PgConnection` so callers control the transaction
//! boundary.

use crate::error::AppError;
use crate::models::{BillingInvoice, LedgerEntry, PaymentMethod, UsageMeter, WebhookEvent};
use crate::services::metrics::DB_QUERY_DURATION;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "licensing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// List invoices for a tenant, newest first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_invoices(&self, tenant_id: Uuid) -> Result<Vec<BillingInvoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, BillingInvoice>(
            r#"
            SELECT invoice_id, tenant_id, license_id, ledger_entry_id, amount_cents, currency, status, issued_at, due_at, paid_at
            FROM billing_invoices
            WHERE tenant_id = $1
            ORDER BY issued_at DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list invoices: {}", e)))?;

        timer.observe_duration();

        Ok(invoices)
    }

    /// List ledger entries for a tenant, newest first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_ledger_entries(&self, tenant_id: Uuid) -> Result<Vec<LedgerEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_ledger_entries"])
            .start_timer();

        let entries = sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT entry_id, tenant_id, license_id, amount_cents, currency, entry_type, description, idempotency_key, recorded_at
            FROM ledger_entries
            WHERE tenant_id = $1
            ORDER BY recorded_at DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list ledger entries: {}", e)))?;

        timer.observe_duration();

        Ok(entries)
    }

    /// List usage meters for a tenant.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_usage_meters(&self, tenant_id: Uuid) -> Result<Vec<UsageMeter>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_usage_meters"])
            .start_timer();

        let meters = sqlx::query_as::<_, UsageMeter>(
            r#"
            SELECT meter_id, tenant_id, meter_key, unit, used_units, license_id, last_recorded_at, created_utc, updated_utc
            FROM usage_meters
            WHERE tenant_id = $1
            ORDER BY meter_key
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list usage meters: {}", e)))?;

        timer.observe_duration();

        Ok(meters)
    }

    /// List payment methods for a tenant, default first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_payment_methods(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<PaymentMethod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payment_methods"])
            .start_timer();

        let methods = sqlx::query_as::<_, PaymentMethod>(
            r#"
            SELECT payment_method_id, tenant_id, provider, external_ref, is_default, created_utc
            FROM payment_methods
            WHERE tenant_id = $1
            ORDER BY is_default DESC, created_utc
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list payment methods: {}", e)))?;

        timer.observe_duration();

        Ok(methods)
    }

    /// List recorded webhook events for a provider, newest first.
    #[instrument(skip(self), fields(provider = %provider))]
    pub async fn list_webhook_events(&self, provider: &str) -> Result<Vec<WebhookEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_webhook_events"])
            .start_timer();

        let events = sqlx::query_as::<_, WebhookEvent>(
            r#"
            SELECT event_id, provider, external_event_id, event_type, signature, payload, status, attempt_count, next_retry_at, last_error, received_at
            FROM webhook_events
            WHERE provider = $1
            ORDER BY received_at DESC
            "#,
        )
        .bind(provider)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list webhook events: {}", e)))?;

        timer.observe_duration();

        Ok(events)
    }
}
