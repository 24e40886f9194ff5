//! Tenant context extraction.
//!
//! The tenant id arrives in the `X-Tenant-ID` header, set by the gateway
//! after it authenticates the caller. Every tenant-scoped route extracts
//! this context instead of reading the header by hand.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::AppError;

/// Tenant identity for the current request.
#[derive(Debug, Clone, Copy)]
pub struct TenantContext {
    pub tenant_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("X-Tenant-ID")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing X-Tenant-ID header"))
            })?;

        let tenant_id = Uuid::parse_str(raw).map_err(|_| {
            AppError::Unauthorized(anyhow::anyhow!("X-Tenant-ID is not a valid UUID"))
        })?;

        tracing::Span::current().record("tenant_id", raw);

        Ok(TenantContext { tenant_id })
    }
}
