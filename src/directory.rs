//! Tenant directory resolver: maps a tenant id to its connection descriptor and
//! status via the control-plane store, cached with a short TTL.

use crate::error::AppError;
use crate::singleflight::KeyedLocks;
use crate::store;
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Tenant lifecycle status as recorded in the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TenantStatus {
    Active,
    Inactive,
    Suspended,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Inactive => "inactive",
            TenantStatus::Suspended => "suspended",
        }
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(TenantStatus::Active),
            "inactive" => Ok(TenantStatus::Inactive),
            "suspended" => Ok(TenantStatus::Suspended),
            _ => Err(AppError::BadRequest(format!(
                "invalid tenant status: {} (expected active, inactive or suspended)",
                s
            ))),
        }
    }
}

/// One row of the directory, as returned by the store.
#[derive(Clone, Debug)]
pub struct TenantRow {
    pub tenant_id: String,
    pub database_url: String,
    pub status: TenantStatus,
}

/// A resolved directory record. Immutable within its TTL window.
#[derive(Clone, Debug)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub database_url: String,
    pub status: TenantStatus,
    pub cached_at: Instant,
}

/// Read-only lookup against the control-plane tenant directory.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn fetch(&self, tenant_id: &str) -> Result<Option<TenantRow>, AppError>;
}

/// Production store: queries `_sys_tenants` on the control-plane pool.
pub struct PgDirectoryStore {
    pool: PgPool,
}

impl PgDirectoryStore {
    pub fn new(pool: PgPool) -> Self {
        PgDirectoryStore { pool }
    }
}

#[async_trait]
impl DirectoryStore for PgDirectoryStore {
    async fn fetch(&self, tenant_id: &str) -> Result<Option<TenantRow>, AppError> {
        let row = store::fetch_tenant(&self.pool, tenant_id).await?;
        match row {
            None => Ok(None),
            Some((id, database_url, status_str, _updated_at)) => {
                let status = status_str.parse().map_err(|_| {
                    AppError::Directory(format!("tenant {}: invalid status '{}'", id, status_str))
                })?;
                Ok(Some(TenantRow {
                    tenant_id: id,
                    database_url,
                    status,
                }))
            }
        }
    }
}

/// TTL cache over a `DirectoryStore`. Refetches are single-flighted per tenant
/// so an expired hot entry does not cause a lookup storm.
pub struct Directory {
    store: Arc<dyn DirectoryStore>,
    ttl: Duration,
    cache: Mutex<HashMap<String, TenantRecord>>,
    fetching: KeyedLocks,
}

impl Directory {
    pub fn new(store: Arc<dyn DirectoryStore>, ttl: Duration) -> Self {
        Directory {
            store,
            ttl,
            cache: Mutex::new(HashMap::new()),
            fetching: KeyedLocks::new(),
        }
    }

    /// Resolve a tenant id to its directory record. Status is carried on the
    /// record, not surfaced as an error; callers decide what non-active means.
    pub async fn resolve(&self, tenant_id: &str) -> Result<TenantRecord, AppError> {
        if let Some(rec) = self.cached(tenant_id) {
            return Ok(rec);
        }

        let lock = self.fetching.lock_for(tenant_id);
        let _guard = lock.lock().await;
        // another caller may have refetched while we waited
        if let Some(rec) = self.cached(tenant_id) {
            drop(_guard);
            drop(lock);
            self.fetching.gc(tenant_id);
            return Ok(rec);
        }

        let result = self.store.fetch(tenant_id).await;
        let out = match result {
            Ok(Some(row)) => {
                let rec = TenantRecord {
                    tenant_id: row.tenant_id,
                    database_url: row.database_url,
                    status: row.status,
                    cached_at: Instant::now(),
                };
                self.lock_cache().insert(tenant_id.to_string(), rec.clone());
                Ok(rec)
            }
            Ok(None) => {
                self.lock_cache().remove(tenant_id);
                Err(AppError::TenantNotFound(tenant_id.to_string()))
            }
            Err(e) => Err(e),
        };
        drop(_guard);
        drop(lock);
        self.fetching.gc(tenant_id);
        out
    }

    /// Drop the cached record so the next resolve goes to the store.
    pub fn invalidate(&self, tenant_id: &str) {
        self.lock_cache().remove(tenant_id);
    }

    fn cached(&self, tenant_id: &str) -> Option<TenantRecord> {
        let cache = self.lock_cache();
        cache
            .get(tenant_id)
            .filter(|rec| rec.cached_at.elapsed() < self.ttl)
            .cloned()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, TenantRecord>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        rows: HashMap<String, TenantRow>,
        fetches: AtomicUsize,
    }

    impl CountingStore {
        fn with(rows: Vec<TenantRow>) -> Self {
            CountingStore {
                rows: rows.into_iter().map(|r| (r.tenant_id.clone(), r)).collect(),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DirectoryStore for CountingStore {
        async fn fetch(&self, tenant_id: &str) -> Result<Option<TenantRow>, AppError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows.get(tenant_id).cloned())
        }
    }

    fn row(id: &str) -> TenantRow {
        TenantRow {
            tenant_id: id.into(),
            database_url: format!("postgres://localhost/{}", id),
            status: TenantStatus::Active,
        }
    }

    #[tokio::test]
    async fn record_served_from_cache_within_ttl() {
        let store = Arc::new(CountingStore::with(vec![row("acme")]));
        let dir = Directory::new(store.clone(), Duration::from_secs(60));
        dir.resolve("acme").await.unwrap();
        dir.resolve("acme").await.unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_record_is_refetched() {
        let store = Arc::new(CountingStore::with(vec![row("acme")]));
        let dir = Directory::new(store.clone(), Duration::ZERO);
        dir.resolve("acme").await.unwrap();
        dir.resolve("acme").await.unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_tenant_is_not_found() {
        let store = Arc::new(CountingStore::with(vec![]));
        let dir = Directory::new(store, Duration::from_secs(60));
        let err = dir.resolve("ghost").await.unwrap_err();
        assert!(matches!(err, AppError::TenantNotFound(_)));
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let store = Arc::new(CountingStore::with(vec![row("acme")]));
        let dir = Directory::new(store.clone(), Duration::from_secs(60));
        dir.resolve("acme").await.unwrap();
        dir.invalidate("acme");
        dir.resolve("acme").await.unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Active".parse::<TenantStatus>().unwrap(), TenantStatus::Active);
        assert!("deleted".parse::<TenantStatus>().is_err());
    }
}
