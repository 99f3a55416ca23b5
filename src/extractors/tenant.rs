//! Tenant id extraction (X-Tenant-ID header) and the strongly-typed request
//! carrier for the resolved pool handle.

use crate::error::AppError;
use crate::registry::Handle;
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts, http::HeaderMap};

/// Header name for tenant id. Default: `X-Tenant-ID`.
pub const TENANT_ID_HEADER: &str = "X-Tenant-ID";

/// Extractor for the required tenant id. A UUID or a slug of up to 64
/// alphanumeric/`-`/`_` characters.
#[derive(Clone, Debug)]
pub struct TenantId(pub String);

/// Pull the tenant id out of a header map. Shared by the extractor and the
/// resolver middleware.
pub fn tenant_id_from_headers(headers: &HeaderMap) -> Result<String, AppError> {
    let value = headers
        .get(TENANT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(AppError::MissingTenant)?;
    if !valid_tenant_id(value) {
        return Err(AppError::BadRequest(format!("invalid tenant id: {}", value)));
    }
    Ok(value.to_string())
}

fn valid_tenant_id(s: &str) -> bool {
    uuid::Uuid::parse_str(s).is_ok()
        || (s.len() <= 64
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        tenant_id_from_headers(&parts.headers).map(TenantId)
    }
}

/// The resolved tenant connection, attached to request extensions by the
/// resolver middleware. A typed accessor: absence is a typed error, never a
/// runtime cast failure.
#[derive(Clone)]
pub struct TenantConn(pub Handle);

impl TenantConn {
    pub fn handle(&self) -> &Handle {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantConn
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantConn>()
            .cloned()
            .ok_or(AppError::HandleNotAttached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_and_uuids_are_accepted() {
        assert!(valid_tenant_id("acme-corp_01"));
        assert!(valid_tenant_id("7f9c24e5-2f3a-4b18-9c7d-1a2b3c4d5e6f"));
        assert!(!valid_tenant_id("acme corp"));
        assert!(!valid_tenant_id(&"x".repeat(65)));
    }

    #[test]
    fn missing_header_is_a_typed_error() {
        let headers = HeaderMap::new();
        assert!(matches!(
            tenant_id_from_headers(&headers),
            Err(AppError::MissingTenant)
        ));
    }
}
