//! Control-plane storage: the `_sys_tenants` directory table. Lives in a schema named
//! from `TENANCY_SCHEMA` env (default `tenancy`).

use crate::error::AppError;
use sqlx::ConnectOptions;
use sqlx::PgPool;
use std::str::FromStr;

/// Schema name for control-plane tables. From env `TENANCY_SCHEMA`, default `tenancy`.
/// Must be a valid PostgreSQL identifier.
pub fn tenancy_schema() -> String {
    std::env::var("TENANCY_SCHEMA").unwrap_or_else(|_| "tenancy".into())
}

/// Returns schema-qualified table name (e.g. "tenancy._sys_tenants").
pub fn qualified_sys_table(table: &str) -> String {
    format!("{}.{}", tenancy_schema(), table)
}

/// Raw directory row as stored in `_sys_tenants`.
pub type TenantDbRow = (String, String, String, chrono::DateTime<chrono::Utc>);

/// Create schema from `TENANCY_SCHEMA` env if not exists, then the `_sys_tenants` table.
pub async fn ensure_sys_tables(pool: &PgPool) -> Result<(), AppError> {
    let schema = tenancy_schema();
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(pool)
        .await?;

    let q_tenants = qualified_sys_table("_sys_tenants");
    let ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id TEXT PRIMARY KEY,
            database_url TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            comment TEXT
        )
        "#,
        q_tenants
    );
    sqlx::query(&ddl).execute(pool).await?;
    Ok(())
}

/// Fetch one directory row by tenant id.
pub async fn fetch_tenant(pool: &PgPool, tenant_id: &str) -> Result<Option<TenantDbRow>, AppError> {
    let q_tenants = qualified_sys_table("_sys_tenants");
    let sql = format!(
        "SELECT id, database_url, status, updated_at FROM {} WHERE id = $1",
        q_tenants
    );
    let row = sqlx::query_as::<_, TenantDbRow>(&sql)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// List all directory rows, ordered by id.
pub async fn list_tenants(pool: &PgPool) -> Result<Vec<TenantDbRow>, AppError> {
    let q_tenants = qualified_sys_table("_sys_tenants");
    let sql = format!(
        "SELECT id, database_url, status, updated_at FROM {} ORDER BY id",
        q_tenants
    );
    let rows = sqlx::query_as::<_, TenantDbRow>(&sql).fetch_all(pool).await?;
    Ok(rows)
}

/// Insert or replace a tenant's directory row.
pub async fn upsert_tenant(
    pool: &PgPool,
    tenant_id: &str,
    database_url: &str,
    status: &str,
) -> Result<(), AppError> {
    let q_tenants = qualified_sys_table("_sys_tenants");
    let sql = format!(
        r#"
        INSERT INTO {} (id, database_url, status, updated_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (id)
        DO UPDATE SET database_url = $2, status = $3, updated_at = NOW()
        "#,
        q_tenants
    );
    sqlx::query(&sql)
        .bind(tenant_id)
        .bind(database_url)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

/// Flip a tenant's status. Returns false if the tenant does not exist.
pub async fn set_tenant_status(
    pool: &PgPool,
    tenant_id: &str,
    status: &str,
) -> Result<bool, AppError> {
    let q_tenants = qualified_sys_table("_sys_tenants");
    let sql = format!(
        "UPDATE {} SET status = $2, updated_at = NOW() WHERE id = $1",
        q_tenants
    );
    let result = sqlx::query(&sql)
        .bind(tenant_id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the control pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| AppError::BadRequest(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await.map_err(AppError::Db)?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await
        .map_err(AppError::Db)?;
    if !exists.0 {
        let quoted = quote_ident(&db_name);
        sqlx::query(&format!("CREATE DATABASE {}", quoted))
            .execute(&mut conn)
            .await
            .map_err(AppError::Db)?;
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), AppError> {
    let path_start = url.rfind('/').ok_or_else(|| AppError::BadRequest("DATABASE_URL: no path".into()))? + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    let admin_url = format!("{}postgres", base);
    Ok((admin_url, db_name.to_string()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}
