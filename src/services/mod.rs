pub mod audit;
pub mod catalog;
pub mod database;
pub mod entitlements;
pub mod idempotency;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod payment_methods;
pub mod usage;
pub mod webhook;
