//! Tenant-scoped construction: per-request repository/service graphs built from
//! the attached handle.
//!
//! Construction is allocation-only. It performs no I/O and cannot fail on
//! connectivity; anything connection-related was already resolved or rejected
//! before this stage runs. Nothing built here is cached across requests.

use crate::error::AppError;
use crate::extractors::tenant::TenantConn;
use crate::registry::Handle;
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};

/// A repository or service that can be built from a tenant's pool handle.
pub trait TenantScoped: Sized {
    fn build(handle: &Handle) -> Self;
}

/// Extractor that builds `T` from the request's attached `TenantConn`.
///
/// ```ignore
/// async fn list_courses(Scoped(repo): Scoped<CourseRepository>) -> ... { ... }
/// ```
pub struct Scoped<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for Scoped<T>
where
    S: Send + Sync,
    T: TenantScoped,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let conn = parts
            .extensions
            .get::<TenantConn>()
            .cloned()
            .ok_or(AppError::HandleNotAttached)?;
        Ok(Scoped(T::build(conn.handle())))
    }
}
