//! Catalog endpoints.

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::models::CatalogSku;
use crate::services::catalog;

#[derive(Debug, Deserialize, Default)]
pub struct ListSkusQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

/// List purchasable SKUs, cheapest first.
pub async fn list_skus(
    State(state): State<AppState>,
    Query(query): Query<ListSkusQuery>,
) -> Result<Json<Vec<CatalogSku>>, AppError> {
    let mut conn = state
        .db
        .pool()
        .acquire()
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to acquire connection: {}", e)))?;

    let skus = catalog::list_skus(&mut *conn, query.include_inactive).await?;
    Ok(Json(skus))
}
