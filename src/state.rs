//! Shared application state for all routes.

use crate::manager::PoolManager;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    /// Control-plane pool: directory lookups and admin writes only, never tenant data.
    pub control: PgPool,
    pub manager: Arc<PoolManager>,
}
