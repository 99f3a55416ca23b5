//! Request-scoped resolver: tenant id in, pool handle attached to the request.

use crate::extractors::tenant::{tenant_id_from_headers, TenantConn};
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Resolve the request's tenant to a leased pool handle and attach it as a
/// `TenantConn` extension. Install with `axum::middleware::from_fn_with_state`
/// on every route that touches tenant data.
///
/// Errors are mapped to their HTTP responses here; handlers downstream only
/// ever see a valid handle.
pub async fn resolve_tenant(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let tenant_id = match tenant_id_from_headers(request.headers()) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    match state.manager.get_connection(&tenant_id).await {
        Ok(handle) => {
            request.extensions_mut().insert(TenantConn(handle));
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}
