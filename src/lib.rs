//! Tenancy SDK: database-per-tenant connection resolution and pooling.
//!
//! A tenant id on an inbound request is resolved through a TTL-cached directory
//! to a live, bounded, health-checked PostgreSQL pool, shared across concurrent
//! requests for that tenant. Downstream code consumes the resolved handle and
//! never participates in connection lifecycle.

pub mod config;
pub mod connect;
pub mod directory;
pub mod error;
pub mod extractors;
pub mod factory;
pub mod manager;
pub mod middleware;
pub mod registry;
pub mod response;
pub mod routes;
pub mod singleflight;
pub mod state;
pub mod store;

pub use config::ManagerConfig;
pub use connect::{Connector, PgConnector};
pub use directory::{Directory, DirectoryStore, PgDirectoryStore, TenantRecord, TenantStatus};
pub use error::AppError;
pub use extractors::{TenantConn, TenantId, TENANT_ID_HEADER};
pub use factory::{Scoped, TenantScoped};
pub use manager::PoolManager;
pub use middleware::resolve_tenant;
pub use registry::{Handle, PoolState, PoolStatus, Registry};
pub use routes::{admin_routes, common_routes};
pub use state::AppState;
pub use store::{ensure_database_exists, ensure_sys_tables};
