//! Pool lifecycle manager: the single entry point that turns a tenant id into a
//! leased pool handle, plus the background sweep/probe tasks, invalidation and
//! shutdown.
//!
//! One manager is built at process start and shared by reference through
//! `AppState`; it is never a global.

use crate::config::ManagerConfig;
use crate::connect::{Connector, PgConnector};
use crate::directory::{Directory, DirectoryStore, PgDirectoryStore, TenantRecord, TenantStatus};
use crate::error::AppError;
use crate::registry::{Handle, PoolStatus, Registry};
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::task::JoinHandle;

pub struct PoolManager {
    directory: Directory,
    registry: Registry,
    connector: Arc<dyn Connector>,
    config: ManagerConfig,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolManager {
    /// Build a manager over explicit directory and connector implementations.
    pub fn new(
        store: Arc<dyn DirectoryStore>,
        connector: Arc<dyn Connector>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        Arc::new(PoolManager {
            directory: Directory::new(store, config.directory_ttl),
            registry: Registry::new(),
            connector,
            config,
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Production wiring: directory rows from `_sys_tenants` on the control-plane
    /// pool, real PostgreSQL dials.
    pub fn with_control_pool(control: PgPool, config: ManagerConfig) -> Arc<Self> {
        let connector = PgConnector {
            max_connections: config.connections_per_pool,
            acquire_timeout: config.acquire_timeout,
        };
        PoolManager::new(
            Arc::new(PgDirectoryStore::new(control)),
            Arc::new(connector),
            config,
        )
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Resolve a tenant id to a leased pool handle. The whole resolve + create
    /// path is bounded by `resolve_timeout`; it never blocks indefinitely.
    pub async fn get_connection(&self, tenant_id: &str) -> Result<Handle, AppError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(AppError::ShuttingDown);
        }
        match tokio::time::timeout(self.config.resolve_timeout, self.resolve_and_acquire(tenant_id))
            .await
        {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::warn!(tenant_id = %tenant_id, error = %e, "tenant connection resolution failed");
                }
                result
            }
            Err(_) => {
                tracing::warn!(tenant_id = %tenant_id, "tenant connection resolution timed out");
                Err(AppError::ResolveTimeout(tenant_id.to_string()))
            }
        }
    }

    /// Force eviction of a tenant's pool and directory record. Used when a
    /// tenant's status or descriptor changes.
    pub async fn invalidate(&self, tenant_id: &str) {
        self.directory.invalidate(tenant_id);
        if let Some(entry) = self.registry.evict(tenant_id) {
            tracing::info!(tenant_id = %tenant_id, "evicting pool on invalidation");
            tokio::spawn(async move { entry.close_pool().await });
        }
    }

    /// Spawn the idle sweep and liveness probe loops.
    pub fn start_background(self: &Arc<Self>) {
        let sweeper = self.clone();
        let sweep = tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweeper.config.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                sweeper.sweep_once().await;
            }
        });

        let prober = self.clone();
        let probe = tokio::spawn(async move {
            let mut tick = tokio::time::interval(prober.config.health_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                prober.probe_once().await;
            }
        });

        let mut tasks = self.lock_tasks();
        tasks.push(sweep);
        tasks.push(probe);
    }

    /// One idle sweep: evict entries unused beyond the idle threshold. Exposed
    /// for the background loop and for deterministic tests.
    pub async fn sweep_once(&self) {
        let cutoff = Instant::now();
        for entry in self.registry.evict_idle(self.config.idle_timeout, cutoff) {
            tracing::info!(tenant_id = %entry.tenant_id(), "evicting idle pool");
            entry.close_pool().await;
        }
    }

    /// One liveness pass: ping every healthy pool, mark failures unhealthy. The
    /// next acquisition recreates a marked pool transparently.
    pub async fn probe_once(&self) {
        for entry in self.registry.healthy_entries() {
            let pool = entry.pool();
            if let Err(e) = self.connector.ping(&pool).await {
                tracing::warn!(
                    tenant_id = %entry.tenant_id(),
                    error = %e,
                    "health probe failed, pool marked unhealthy"
                );
                entry.mark_unhealthy();
            }
        }
    }

    /// Registry snapshot for the admin surface.
    pub fn pool_status(&self) -> Vec<PoolStatus> {
        self.registry.snapshot()
    }

    /// Refuse new acquisitions, stop background tasks, wait up to the grace
    /// period for in-flight handles to drain, then close every pool.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.registry.total_leases() > 0 && Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let leaked = self.registry.total_leases();
        if leaked > 0 {
            tracing::warn!(leases = leaked, "shutdown grace expired with handles still leased");
        }

        for entry in self.registry.drain() {
            entry.close_pool().await;
        }
        tracing::info!("tenant pool manager shut down");
    }

    async fn resolve_and_acquire(&self, tenant_id: &str) -> Result<Handle, AppError> {
        loop {
            let record = self.directory.resolve(tenant_id).await?;
            match record.status {
                TenantStatus::Active => {}
                TenantStatus::Inactive | TenantStatus::Suspended => {
                    // status wins over any cached pool: evict before refusing
                    if let Some(entry) = self.registry.evict(tenant_id) {
                        tracing::info!(tenant_id = %tenant_id, status = record.status.as_str(), "evicting pool for deactivated tenant");
                        tokio::spawn(async move { entry.close_pool().await });
                    }
                    return Err(match record.status {
                        TenantStatus::Suspended => AppError::TenantSuspended(tenant_id.to_string()),
                        _ => AppError::TenantInactive(tenant_id.to_string()),
                    });
                }
            }

            let acquired = self
                .registry
                .get_or_create(tenant_id, self.config.max_pools, || {
                    self.dial_with_retry(&record)
                })
                .await;
            match acquired {
                // The pool was invalidated while its dial was in flight; the
                // directory entry was dropped too, so resolving again picks up
                // the current descriptor.
                Err(AppError::PoolInvalidated(_)) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return Err(AppError::ShuttingDown);
                    }
                    tracing::info!(tenant_id = %tenant_id, "pool invalidated mid-creation, re-resolving");
                }
                other => return other,
            }
        }
    }

    /// Dial the tenant's database with bounded retry and exponential backoff.
    async fn dial_with_retry(&self, record: &TenantRecord) -> Result<PgPool, AppError> {
        let mut attempt: u32 = 0;
        loop {
            match self.connector.dial(&record.database_url).await {
                Ok(pool) => {
                    tracing::info!(
                        tenant_id = %record.tenant_id,
                        attempt = attempt + 1,
                        "opened tenant pool"
                    );
                    return Ok(pool);
                }
                Err(e) if attempt < self.config.dial_retries => {
                    attempt += 1;
                    let delay = self.config.dial_backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        tenant_id = %record.tenant_id,
                        attempt = attempt,
                        error = %e,
                        "pool dial failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(AppError::PoolCreationFailed {
                        tenant: record.tenant_id.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
