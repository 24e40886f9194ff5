//! Metrics module for licensing-service.
//! Provides Prometheus metrics for licensing operations and per-tenant metering.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, TextEncoder, histogram_opts, opts,
    register_histogram_vec, register_int_counter_vec,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "licensing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// License operations counter (per-tenant metering)
pub static LICENSE_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Usage record counter (per-tenant metering)
pub static USAGE_RECORDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Ledger entries counter
pub static LEDGER_ENTRIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Webhook events counter
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    LICENSE_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "licensing_license_operations_total",
                "Total license operations by tenant and operation type"
            ),
            &["tenant_id", "operation"]
        )
        .expect("Failed to register LICENSE_OPERATIONS_TOTAL")
    });

    USAGE_RECORDS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "licensing_usage_records_total",
                "Total usage records by tenant and meter"
            ),
            &["tenant_id", "meter_key"]
        )
        .expect("Failed to register USAGE_RECORDS_TOTAL")
    });

    LEDGER_ENTRIES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "licensing_ledger_entries_total",
                "Total ledger entries by tenant and entry type"
            ),
            &["tenant_id", "entry_type"]
        )
        .expect("Failed to register LEDGER_ENTRIES_TOTAL")
    });

    WEBHOOK_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "licensing_webhook_events_total",
                "Total webhook events by provider and status"
            ),
            &["provider", "status"]
        )
        .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "licensing_errors_total",
                "Total errors by type for alerting"
            ),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a license operation.
pub fn record_license_operation(tenant_id: &str, operation: &str) {
    if let Some(counter) = LICENSE_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, operation]).inc();
    }
}

/// Record a usage increment.
pub fn record_usage_operation(tenant_id: &str, meter_key: &str) {
    if let Some(counter) = USAGE_RECORDS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, meter_key]).inc();
    }
}

/// Record a ledger entry.
pub fn record_ledger_entry(tenant_id: &str, entry_type: &str) {
    if let Some(counter) = LEDGER_ENTRIES_TOTAL.get() {
        counter.with_label_values(&[tenant_id, entry_type]).inc();
    }
}

/// Record a webhook event.
pub fn record_webhook_event(provider: &str, status: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[provider, status]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
