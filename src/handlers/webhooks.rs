//! Payment-provider webhook endpoints.
//!
//! The body is taken as a raw string: the HMAC covers the exact bytes the
//! provider sent, so it must not pass through a JSON extractor first.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};

use crate::AppState;
use crate::error::AppError;
use crate::models::WebhookEvent;

/// Ingest a provider webhook delivery.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<WebhookEvent>), AppError> {
    let signature = headers
        .get("X-PSP-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError::InvalidSignature(anyhow::anyhow!("Missing X-PSP-Signature header"))
        })?
        .to_string();

    let mut tx = state
        .db
        .pool()
        .begin()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e)))?;

    let event = state
        .webhooks
        .handle(&mut *tx, &provider, &body, &signature)
        .await?;

    tx.commit()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e)))?;

    Ok((StatusCode::OK, Json(event)))
}

/// List recorded events for a provider.
pub async fn list_webhook_events(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<Vec<WebhookEvent>>, AppError> {
    let events = state.db.list_webhook_events(&provider).await?;
    Ok(Json(events))
}
