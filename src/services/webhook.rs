//! Payment-provider webhook processing.
//!
//! Signature verification happens before any row is written: an event with
//! a bad signature leaves no trace beyond a log line. Accepted events are
//! deduplicated per provider on the provider's own event id.

use crate::error::AppError;
use crate::models::{WebhookEvent, WebhookStatus};
use crate::services::idempotency::{self, Registration};
use crate::services::metrics::{DB_QUERY_DURATION, record_webhook_event};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use sqlx::PgConnection;
use subtle::ConstantTimeEq;
use tracing::instrument;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct WebhookProcessor {
    secret: Secret<String>,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl WebhookProcessor {
    pub fn new(secret: Secret<String>, backoff_base_secs: u64, backoff_cap_secs: u64) -> Self {
        Self {
            secret,
            backoff_base: Duration::seconds(backoff_base_secs as i64),
            backoff_cap: Duration::seconds(backoff_cap_secs as i64),
        }
    }

    /// Verify the hex-encoded HMAC-SHA256 signature over the raw body in
    /// constant time.
    pub fn verify_signature(&self, body: &str, signature_hex: &str) -> bool {
        let expected = match hex::decode(signature_hex) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };

        let mut mac = match HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(body.as_bytes());
        let computed = mac.finalize().into_bytes();

        if expected.len() != computed.len() {
            return false;
        }
        computed.ct_eq(expected.as_slice()).into()
    }

    /// Sign a body the way a provider would. Used by tests and the demo
    /// sender tooling.
    pub fn sign(&self, body: &str) -> Result<String, AppError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("HMAC key error: {}", e)))?;
        mac.update(body.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Retry delay before attempt `attempt + 1`, doubling from the base up
    /// to the cap.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let delay = self
            .backoff_base
            .checked_mul(1 << exponent)
            .unwrap_or(self.backoff_cap);
        delay.min(self.backoff_cap)
    }

    /// Ingest one webhook delivery.
    ///
    /// The raw body must be passed exactly as received; re-serializing the
    /// JSON would break signature verification. A redelivery of an already
    /// seen (provider, event id) pair returns the original event row
    /// without reprocessing.
    #[instrument(skip(self, conn, raw_body, signature), fields(provider = %provider))]
    pub async fn handle(
        &self,
        conn: &mut PgConnection,
        provider: &str,
        raw_body: &str,
        signature: &str,
    ) -> Result<WebhookEvent, AppError> {
        if !self.verify_signature(raw_body, signature) {
            record_webhook_event(provider, "invalid_signature");
            tracing::warn!(provider = %provider, "Webhook signature verification failed");
            return Err(AppError::InvalidSignature(anyhow::anyhow!(
                "Webhook signature mismatch"
            )));
        }

        let payload: serde_json::Value = serde_json::from_str(raw_body)
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid webhook JSON: {}", e)))?;

        let external_event_id = payload["id"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Webhook payload missing 'id'")))?
            .to_string();
        let event_type = payload["type"].as_str().unwrap_or("unknown").to_string();

        let scope = format!("webhook:{}", provider);
        match idempotency::register(conn, &scope, &external_event_id, &payload).await? {
            Registration::Replay(_) => {
                let existing = self
                    .fetch_event(conn, provider, &external_event_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::DatabaseError(anyhow::anyhow!(
                            "Replayed webhook token without event row"
                        ))
                    })?;
                record_webhook_event(provider, "duplicate");
                return Ok(existing);
            }
            Registration::Fresh(_) => {}
        }

        // Simulated downstream failure hook used by provider sandboxes.
        let should_fail = payload["should_fail"].as_bool().unwrap_or(false);
        let now = Utc::now();

        let (status, attempt_count, last_error, next_retry_at): (
            WebhookStatus,
            i32,
            Option<String>,
            Option<DateTime<Utc>>,
        ) = if should_fail {
            (
                WebhookStatus::Failed,
                1,
                Some("Downstream processing failed".to_string()),
                Some(now + self.backoff_delay(1)),
            )
        } else {
            (WebhookStatus::Processed, 1, None, None)
        };

        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_webhook_event"])
            .start_timer();

        let event = sqlx::query_as::<_, WebhookEvent>(
            r#"
            INSERT INTO webhook_events (event_id, provider, external_event_id, event_type,
                signature, payload, status, attempt_count, last_error, next_retry_at, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING event_id, provider, external_event_id, event_type, signature, payload, status,
                attempt_count, next_retry_at, last_error, received_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(provider)
        .bind(&external_event_id)
        .bind(&event_type)
        .bind(signature)
        .bind(&payload)
        .bind(status.as_str())
        .bind(attempt_count)
        .bind(&last_error)
        .bind(next_retry_at)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to store webhook event: {}", e)))?;

        timer.observe_duration();
        record_webhook_event(provider, status.as_str());

        Ok(event)
    }

    async fn fetch_event(
        &self,
        conn: &mut PgConnection,
        provider: &str,
        external_event_id: &str,
    ) -> Result<Option<WebhookEvent>, AppError> {
        sqlx::query_as::<_, WebhookEvent>(
            r#"
            SELECT event_id, provider, external_event_id, event_type, signature, payload, status,
                attempt_count, next_retry_at, last_error, received_at
            FROM webhook_events
            WHERE provider = $1 AND external_event_id = $2
            "#,
        )
        .bind(provider)
        .bind(external_event_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load webhook event: {}", e)))
    }
}
