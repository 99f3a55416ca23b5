//! Tenant directory administration and pool introspection.
//!
//! These routes operate on the control plane only. Descriptor values
//! (database_url) are write-only: they are never echoed back in responses.

use crate::directory::TenantStatus;
use crate::error::AppError;
use crate::response::{success_many, success_one, success_one_ok};
use crate::state::AppState;
use crate::store;
use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct TenantBody {
    id: String,
    status: String,
    updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Deserialize)]
struct UpsertTenantBody {
    database_url: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct StatusBody {
    status: String,
}

/// GET /tenants — directory listing (ids and statuses, no descriptors).
async fn list_tenants(State(state): State<AppState>) -> Result<impl axum::response::IntoResponse, AppError> {
    let rows = store::list_tenants(&state.control).await?;
    let data: Vec<TenantBody> = rows
        .into_iter()
        .map(|(id, _url, status, updated_at)| TenantBody {
            id,
            status,
            updated_at,
        })
        .collect();
    Ok(success_many(data))
}

/// PUT /tenants/:id — create or replace a tenant's directory row. Any cached
/// record or pool for the tenant is invalidated so the change takes effect
/// immediately.
async fn upsert_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(body): Json<UpsertTenantBody>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    if body.database_url.trim().is_empty() {
        return Err(AppError::BadRequest("database_url must not be empty".into()));
    }
    let status: TenantStatus = body.status.as_deref().unwrap_or("active").parse()?;
    store::upsert_tenant(&state.control, &tenant_id, &body.database_url, status.as_str()).await?;
    state.manager.invalidate(&tenant_id).await;
    Ok(success_one(serde_json::json!({ "id": tenant_id, "status": status.as_str() })))
}

/// POST /tenants/:id/status — flip a tenant's status. A flip away from active
/// evicts any live pool immediately; requests in flight see the policy error,
/// never stale data.
async fn set_status(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let status: TenantStatus = body.status.parse()?;
    let updated = store::set_tenant_status(&state.control, &tenant_id, status.as_str()).await?;
    if !updated {
        return Err(AppError::TenantNotFound(tenant_id));
    }
    state.manager.invalidate(&tenant_id).await;
    Ok(success_one_ok(serde_json::json!({ "id": tenant_id, "status": status.as_str() })))
}

/// POST /tenants/:id/invalidate — force-evict a tenant's pool and cached record.
async fn invalidate(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    state.manager.invalidate(&tenant_id).await;
    Ok(success_one_ok(serde_json::json!({ "id": tenant_id, "invalidated": true })))
}

/// GET /pools — live registry snapshot.
async fn pool_status(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    success_many(state.manager.pool_status())
}

pub fn admin_routes(state: AppState) -> Router {
    Router::new()
        .route("/tenants", get(list_tenants))
        .route("/tenants/:tenant_id", put(upsert_tenant))
        .route("/tenants/:tenant_id/status", post(set_status))
        .route("/tenants/:tenant_id/invalidate", post(invalidate))
        .route("/pools", get(pool_status))
        .with_state(state)
}
