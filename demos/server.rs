//! Demo server: control-plane setup, pool manager wiring, and a tenant-scoped
//! route showing the factory pattern. Tenants are administered via the admin
//! routes; tenant requests carry X-Tenant-ID.

use axum::{middleware::from_fn_with_state, routing::get, Json, Router};
use std::sync::Arc;
use tenancy_sdk::{
    admin_routes, common_routes, ensure_database_exists, ensure_sys_tables, resolve_tenant,
    AppError, AppState, Handle, ManagerConfig, PoolManager, Scoped, TenantScoped,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tracing_subscriber::EnvFilter;

/// Example of a per-request, tenant-scoped repository: holds the leased handle,
/// does no I/O at construction time.
struct TenantInfoRepository {
    handle: Handle,
}

impl TenantScoped for TenantInfoRepository {
    fn build(handle: &Handle) -> Self {
        TenantInfoRepository {
            handle: handle.clone(),
        }
    }
}

impl TenantInfoRepository {
    async fn current_database(&self) -> Result<String, AppError> {
        let row: (String,) = sqlx::query_as("SELECT current_database()")
            .fetch_one(self.handle.pool())
            .await?;
        Ok(row.0)
    }
}

async fn whoami(Scoped(repo): Scoped<TenantInfoRepository>) -> Result<Json<serde_json::Value>, AppError> {
    let database = repo.current_database().await?;
    Ok(Json(serde_json::json!({
        "tenant_id": repo.handle.tenant_id(),
        "database": database,
        "pool_generation": repo.handle.generation(),
    })))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tenancy_sdk=info".parse()?))
        .init();

    let control_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/tenancy".into());
    ensure_database_exists(&control_url).await?;
    let control = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&control_url)
        .await?;
    ensure_sys_tables(&control).await?;

    let manager = PoolManager::with_control_pool(control.clone(), ManagerConfig::from_env());
    manager.start_background();
    let state = AppState {
        control,
        manager: Arc::clone(&manager),
    };

    let tenant_api = Router::new()
        .route("/whoami", get(whoami))
        .layer(from_fn_with_state(state.clone(), resolve_tenant));

    let app = Router::new()
        .merge(common_routes(state.clone()))
        .nest("/api/v1/admin", admin_routes(state.clone()))
        .nest("/api/v1", tenant_api)
        .layer(ServiceBuilder::new().layer(RequestBodyLimitLayer::new(1024 * 1024)));

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    manager.shutdown().await;
    Ok(())
}
