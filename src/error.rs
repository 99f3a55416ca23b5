//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("tenant not found: {0}")]
    TenantNotFound(String),
    #[error("tenant inactive: {0}")]
    TenantInactive(String),
    #[error("tenant suspended: {0}")]
    TenantSuspended(String),
    #[error("pool creation failed for tenant {tenant}: {source}")]
    PoolCreationFailed {
        tenant: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("pool capacity exhausted: {max} pools open, none idle")]
    PoolExhausted { max: usize },
    #[error("pool invalidated while being created for tenant {0}")]
    PoolInvalidated(String),
    #[error("tenant resolution timed out: {0}")]
    ResolveTimeout(String),
    #[error("request has no tenant identifier")]
    MissingTenant,
    #[error("no tenant connection attached to request")]
    HandleNotAttached,
    #[error("pool manager is shutting down")]
    ShuttingDown,
    #[error("tenant directory: {0}")]
    Directory(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("bad request: {0}")]
    BadRequest(String),
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::TenantNotFound(_) => (StatusCode::NOT_FOUND, "tenant_not_found"),
            AppError::TenantInactive(_) => (StatusCode::FORBIDDEN, "tenant_inactive"),
            AppError::TenantSuspended(_) => (StatusCode::FORBIDDEN, "tenant_suspended"),
            AppError::PoolCreationFailed { .. } => (StatusCode::BAD_GATEWAY, "pool_creation_failed"),
            AppError::PoolExhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "pool_exhausted"),
            AppError::PoolInvalidated(_) => (StatusCode::SERVICE_UNAVAILABLE, "pool_invalidated"),
            AppError::ResolveTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "resolve_timeout"),
            AppError::MissingTenant => (StatusCode::BAD_REQUEST, "missing_tenant"),
            AppError::HandleNotAttached => (StatusCode::INTERNAL_SERVER_ERROR, "handle_not_attached"),
            AppError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            AppError::Directory(_) => (StatusCode::INTERNAL_SERVER_ERROR, "directory_error"),
            AppError::Db(e) => {
                if let sqlx::Error::RowNotFound = e {
                    (StatusCode::NOT_FOUND, "not_found")
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "database_error")
                }
            }
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
