//! Payment method storage.
//!
//! Only provider references are stored here, never card data. Presence of
//! any payment method is what the trial sweep checks before auto-converting
//! a tenant to a paid license.

use crate::error::AppError;
use crate::models::PaymentMethod;
use crate::services::idempotency::{self, Registration};
use crate::services::metrics::DB_QUERY_DURATION;
use serde_json::json;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

/// Input for attaching a payment method.
#[derive(Debug, Clone)]
pub struct AddPaymentMethod {
    pub tenant_id: Uuid,
    pub provider: String,
    pub external_ref: String,
    pub is_default: bool,
}

/// Attach a payment method reference to a tenant.
#[instrument(skip(conn, input), fields(tenant_id = %input.tenant_id, provider = %input.provider))]
pub async fn add(
    conn: &mut PgConnection,
    input: &AddPaymentMethod,
    idem_key: &str,
) -> Result<PaymentMethod, AppError> {
    let payload = json!({
        "op": "add_payment_method",
        "provider": input.provider,
        "external_ref": input.external_ref,
        "is_default": input.is_default,
    });
    let scope = format!("payment-method:{}", input.tenant_id);
    let token = match idempotency::register(conn, &scope, idem_key, &payload).await? {
        Registration::Replay(token) => {
            let id = token.entity_id.ok_or_else(|| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Replayed payment method token has no entity"
                ))
            })?;
            return fetch(conn, id).await;
        }
        Registration::Fresh(token) => token,
    };

    if input.is_default {
        sqlx::query("UPDATE payment_methods SET is_default = FALSE WHERE tenant_id = $1 AND is_default")
            .bind(input.tenant_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to clear default payment method: {}", e))
            })?;
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["add_payment_method"])
        .start_timer();

    let method = sqlx::query_as::<_, PaymentMethod>(
        r#"
        INSERT INTO payment_methods (payment_method_id, tenant_id, provider, external_ref, is_default)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING payment_method_id, tenant_id, provider, external_ref, is_default, created_utc
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(input.tenant_id)
    .bind(&input.provider)
    .bind(&input.external_ref)
    .bind(input.is_default)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to add payment method: {}", e)))?;

    timer.observe_duration();

    idempotency::attach_entity(conn, token.token_id, method.payment_method_id).await?;

    Ok(method)
}

/// Remove a tenant's payment method. NotFound when it does not belong to
/// the tenant or was already removed; a replay of a removal that already
/// happened succeeds without touching rows.
#[instrument(skip(conn), fields(tenant_id = %tenant_id, payment_method_id = %payment_method_id))]
pub async fn remove(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    payment_method_id: Uuid,
    idem_key: &str,
) -> Result<(), AppError> {
    let payload = json!({ "op": "remove_payment_method", "payment_method_id": payment_method_id });
    let scope = format!("payment-method:{}", tenant_id);
    let token = match idempotency::register(conn, &scope, idem_key, &payload).await? {
        Registration::Replay(_) => return Ok(()),
        Registration::Fresh(token) => token,
    };

    let removed = sqlx::query_as::<_, PaymentMethod>(
        r#"
        DELETE FROM payment_methods
        WHERE payment_method_id = $1 AND tenant_id = $2
        RETURNING payment_method_id, tenant_id, provider, external_ref, is_default, created_utc
        "#,
    )
    .bind(payment_method_id)
    .bind(tenant_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to remove payment method: {}", e)))?
    .ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!(
            "Payment method {} not found for tenant",
            payment_method_id
        ))
    })?;

    idempotency::attach_entity(conn, token.token_id, removed.payment_method_id).await?;

    Ok(())
}

async fn fetch(conn: &mut PgConnection, payment_method_id: Uuid) -> Result<PaymentMethod, AppError> {
    sqlx::query_as::<_, PaymentMethod>(
        r#"
        SELECT payment_method_id, tenant_id, provider, external_ref, is_default, created_utc
        FROM payment_methods
        WHERE payment_method_id = $1
        "#,
    )
    .bind(payment_method_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load payment method: {}", e)))?
    .ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!(
            "Payment method {} not found",
            payment_method_id
        ))
    })
}
