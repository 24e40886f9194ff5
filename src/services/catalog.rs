//! Catalog of purchasable SKUs. Read-only at run time; writes are
//! administrative.

use crate::error::AppError;
use crate::models::CatalogSku;
use crate::services::metrics::DB_QUERY_DURATION;
use sqlx::PgConnection;
use tracing::instrument;

/// List SKUs ordered by price ascending.
#[instrument(skip(conn))]
pub async fn list_skus(
    conn: &mut PgConnection,
    include_inactive: bool,
) -> Result<Vec<CatalogSku>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["list_skus"])
        .start_timer();

    let skus = sqlx::query_as::<_, CatalogSku>(
        r#"
        SELECT sku_id, code, name, term, trial_days, amount_cents, currency, is_active, created_utc, updated_utc
        FROM catalog_skus
        WHERE ($1::bool = TRUE OR is_active = TRUE)
        ORDER BY amount_cents ASC, code
        "#,
    )
    .bind(include_inactive)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list SKUs: {}", e)))?;

    timer.observe_duration();

    Ok(skus)
}

/// Look up an active SKU by code.
#[instrument(skip(conn), fields(code = %code))]
pub async fn price_for(conn: &mut PgConnection, code: &str) -> Result<CatalogSku, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["price_for"])
        .start_timer();

    let sku = sqlx::query_as::<_, CatalogSku>(
        r#"
        SELECT sku_id, code, name, term, trial_days, amount_cents, currency, is_active, created_utc, updated_utc
        FROM catalog_skus
        WHERE code = $1 AND is_active = TRUE
        "#,
    )
    .bind(code)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get SKU: {}", e)))?;

    timer.observe_duration();

    sku.ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Unknown or inactive SKU '{}'", code)))
}
