//! Licensing service: subscriptions, entitlements, usage metering and the
//! billing ledger for the maintenance operations platform.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod services;
pub mod startup;

use std::sync::Arc;

use config::Config;
use services::audit::AuditSink;
use services::database::Database;
use services::lifecycle::LifecycleManager;
use services::webhook::WebhookProcessor;

pub use startup::Application;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub lifecycle: LifecycleManager,
    pub webhooks: WebhookProcessor,
    pub audit: AuditSink,
}
