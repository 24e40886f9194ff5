//! Application startup and lifecycle management.

use crate::AppState;
use crate::config::Config;
use crate::error::AppError;
use crate::handlers;
use crate::services::audit::AuditSink;
use crate::services::database::Database;
use crate::services::lifecycle::{LifecycleConfig, LifecycleManager};
use crate::services::metrics::init_metrics;
use crate::services::webhook::WebhookProcessor;
use axum::{
    Router,
    routing::{delete, get, post},
};
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: Config) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: Config, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let audit = AuditSink::new(db.pool().clone());
        let lifecycle = LifecycleManager::new(
            LifecycleConfig {
                trial_grace_days: config.trial_grace_days,
                invoice_due_days: config.invoice_due_days,
                warn_threshold: config.usage_warn_threshold,
                ..LifecycleConfig::default()
            },
            audit.clone(),
        );
        let webhooks = WebhookProcessor::new(
            config.webhook.secret.clone(),
            config.webhook.backoff_base_secs,
            config.webhook.backoff_cap_secs,
        );

        let state = AppState {
            db,
            config: Arc::new(config.clone()),
            lifecycle,
            webhooks,
            audit,
        };

        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid listen address: {}", e)))?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind listener");
            AppError::InternalError(anyhow::anyhow!("Failed to bind {}: {}", addr, e))
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Listener address error: {}", e)))?
            .port();

        tracing::info!(port = port, "Licensing service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        axum::serve(self.listener, router).await
    }
}

/// Build the full HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        // Catalog
        .route("/billing/catalog", get(handlers::catalog::list_skus))
        // Subscription lifecycle
        .route(
            "/billing/subscription",
            get(handlers::subscription::get_current_license),
        )
        .route("/billing/trial", post(handlers::subscription::start_trial))
        .route("/billing/purchase", post(handlers::subscription::purchase))
        .route("/billing/cancel", post(handlers::subscription::cancel))
        .route("/billing/sweep", post(handlers::subscription::sweep))
        // Entitlements
        .route(
            "/billing/entitlements",
            get(handlers::entitlements::resolve),
        )
        .route(
            "/billing/licenses/:license_id/entitlements",
            post(handlers::entitlements::grant),
        )
        .route(
            "/billing/licenses/:license_id/entitlements/:key",
            delete(handlers::entitlements::revoke),
        )
        // Usage metering
        .route(
            "/billing/usage-meters",
            get(handlers::usage::list_meters),
        )
        .route("/billing/usage", post(handlers::usage::record_usage))
        // Ledger and invoices
        .route("/billing/ledger", get(handlers::ledger::list_ledger_entries))
        .route("/billing/invoices", get(handlers::ledger::list_invoices))
        // Payment methods
        .route(
            "/billing/payment-methods",
            get(handlers::payment_methods::list_payment_methods)
                .post(handlers::payment_methods::add_payment_method),
        )
        .route(
            "/billing/payment-methods/:payment_method_id",
            delete(handlers::payment_methods::remove_payment_method),
        )
        // Provider webhooks
        .route(
            "/billing/webhooks/:provider",
            post(handlers::webhooks::receive_webhook),
        )
        .route(
            "/billing/webhooks/:provider/events",
            get(handlers::webhooks::list_webhook_events),
        )
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    tenant_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}
