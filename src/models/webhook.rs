//! Inbound payment-provider webhook event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Processing outcome for a recorded webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Processed,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Processed => "processed",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "failed" => WebhookStatus::Failed,
            _ => WebhookStatus::Processed,
        }
    }
}

/// Recorded provider event. `external_event_id` is the provider-scoped
/// idempotency key; retry execution belongs to an external scheduler, this
/// row only records the schedule.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookEvent {
    pub event_id: Uuid,
    pub provider: String,
    pub external_event_id: String,
    pub event_type: String,
    pub signature: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempt_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn parsed_status(&self) -> WebhookStatus {
        WebhookStatus::from_string(&self.status)
    }
}
