//! Connector seam between the lifecycle manager and the database driver.
//!
//! Production dials real PostgreSQL pools; tests substitute a stub that hands out
//! lazy pools, which is what makes the creation/eviction semantics testable
//! without a live server.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Opens tenant pools and probes their liveness.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a pool for the given connection descriptor.
    async fn dial(&self, database_url: &str) -> Result<PgPool, sqlx::Error>;

    /// No-op round-trip to verify the pool can still reach its database.
    async fn ping(&self, pool: &PgPool) -> Result<(), sqlx::Error>;
}

/// Default connector: bounded sqlx PostgreSQL pools, `SELECT 1` liveness probe.
pub struct PgConnector {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[async_trait]
impl Connector for PgConnector {
    async fn dial(&self, database_url: &str) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(database_url)
            .await
    }

    async fn ping(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
    }
}
