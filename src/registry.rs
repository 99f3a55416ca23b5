//! Tenant pool cache: at most one live pool per tenant, single-flighted creation,
//! LRU eviction of idle entries under the global cap.
//!
//! The registry lock guards map and state swaps only; dialing always happens
//! outside it, coordinated per tenant by a creation lock, so one tenant's slow
//! dial never serializes another tenant's.

use crate::error::AppError;
use crate::singleflight::KeyedLocks;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lifecycle state of a cached pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    Creating,
    Healthy,
    Unhealthy,
    Recreating,
    Evicted,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Creating => "creating",
            PoolState::Healthy => "healthy",
            PoolState::Unhealthy => "unhealthy",
            PoolState::Recreating => "recreating",
            PoolState::Evicted => "evicted",
        }
    }
}

/// One cached tenant pool. State transitions are owned by the registry and the
/// lifecycle manager; nothing else mutates them.
pub struct PoolEntry {
    tenant_id: String,
    pool: Mutex<PgPool>,
    state: Mutex<PoolState>,
    generation: AtomicU64,
    last_used: Mutex<Instant>,
    leases: AtomicUsize,
}

impl PoolEntry {
    fn new(tenant_id: &str, pool: PgPool, generation: u64) -> Self {
        PoolEntry {
            tenant_id: tenant_id.to_string(),
            pool: Mutex::new(pool),
            state: Mutex::new(PoolState::Healthy),
            generation: AtomicU64::new(generation),
            last_used: Mutex::new(Instant::now()),
            leases: AtomicUsize::new(0),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PoolState {
        *locked(&self.state)
    }

    /// A clone of the current underlying pool.
    pub fn pool(&self) -> PgPool {
        locked(&self.pool).clone()
    }

    pub fn idle_for(&self) -> Duration {
        locked(&self.last_used).elapsed()
    }

    pub(crate) fn mark_unhealthy(&self) {
        *locked(&self.state) = PoolState::Unhealthy;
    }

    fn set_state(&self, state: PoolState) {
        *locked(&self.state) = state;
    }

    fn is_healthy(&self) -> bool {
        *locked(&self.state) == PoolState::Healthy
    }

    /// Replace the pool after recreation; returns the old pool for closing.
    fn swap_pool(&self, pool: PgPool, generation: u64) -> PgPool {
        let mut slot = locked(&self.pool);
        let old = std::mem::replace(&mut *slot, pool);
        self.generation.store(generation, Ordering::SeqCst);
        old
    }

    fn touch(&self) {
        *locked(&self.last_used) = Instant::now();
    }

    fn lease(self: &Arc<Self>) -> Handle {
        self.leases.fetch_add(1, Ordering::SeqCst);
        self.touch();
        Handle {
            pool: self.pool(),
            entry: self.clone(),
        }
    }

    /// Close the underlying pool, waiting for checked-out connections to return.
    pub(crate) async fn close_pool(&self) {
        let pool = self.pool();
        pool.close().await;
    }
}

/// A leased reference to a tenant's pool. Cloning extends the lease; dropping the
/// last clone marks the entry recently used and lets the sweep consider it idle.
pub struct Handle {
    pool: PgPool,
    entry: Arc<PoolEntry>,
}

impl Handle {
    pub fn tenant_id(&self) -> &str {
        self.entry.tenant_id()
    }

    /// Process-wide dial counter; changes iff the underlying pool was re-dialed.
    pub fn generation(&self) -> u64 {
        self.entry.generation()
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Deref for Handle {
    type Target = PgPool;

    fn deref(&self) -> &PgPool {
        &self.pool
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        self.entry.leases.fetch_add(1, Ordering::SeqCst);
        Handle {
            pool: self.pool.clone(),
            entry: self.entry.clone(),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.entry.leases.fetch_sub(1, Ordering::SeqCst);
        self.entry.touch();
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("tenant_id", &self.tenant_id())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Point-in-time view of one registry entry, for the admin surface.
#[derive(Serialize)]
pub struct PoolStatus {
    pub tenant_id: String,
    pub state: &'static str,
    pub generation: u64,
    pub leases: usize,
    pub idle_secs: u64,
}

struct Inner {
    entries: HashMap<String, Arc<PoolEntry>>,
    /// Tenants with a dial in flight; counted against the cap so concurrent
    /// first-requests cannot overshoot it.
    creating: HashSet<String>,
    /// Per-tenant invalidation epoch, bumped by every eviction (including
    /// evictions that find no entry). A dial that started before the bump must
    /// not cache its result: its descriptor may predate the invalidation.
    invalidations: HashMap<String, u64>,
}

impl Inner {
    fn invalidation_epoch(&self, tenant_id: &str) -> u64 {
        self.invalidations.get(tenant_id).copied().unwrap_or(0)
    }

    fn bump_invalidation(&mut self, tenant_id: &str) {
        *self.invalidations.entry(tenant_id.to_string()).or_insert(0) += 1;
    }
}

/// Keyed store of tenant id -> live pool. Exactly one non-evicted entry exists
/// per tenant; the per-tenant creation lock enforces it.
pub struct Registry {
    inner: Mutex<Inner>,
    creation: KeyedLocks,
    generations: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                creating: HashSet::new(),
                invalidations: HashMap::new(),
            }),
            creation: KeyedLocks::new(),
            generations: AtomicU64::new(0),
        }
    }

    /// Fast path: lease the tenant's pool if a healthy entry exists.
    pub fn get(&self, tenant_id: &str) -> Option<Handle> {
        let inner = locked(&self.inner);
        inner
            .entries
            .get(tenant_id)
            .filter(|e| e.is_healthy())
            .map(PoolEntry::lease)
    }

    /// Lease the tenant's pool, dialing it first if absent or unhealthy. For any
    /// set of concurrent calls with the same tenant, `dial` runs at most once;
    /// a failed dial leaves nothing behind, so the next call retries cleanly.
    pub async fn get_or_create<F, Fut>(
        &self,
        tenant_id: &str,
        max_pools: usize,
        dial: F,
    ) -> Result<Handle, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PgPool, AppError>>,
    {
        if let Some(handle) = self.get(tenant_id) {
            return Ok(handle);
        }

        let lock = self.creation.lock_for(tenant_id);
        let result = {
            let _guard = lock.lock().await;
            self.create_locked(tenant_id, max_pools, dial).await
        };
        drop(lock);
        self.creation.gc(tenant_id);
        result
    }

    /// Remove the tenant's entry, if any. The caller closes the returned entry's
    /// pool; handles already leased keep working until they are dropped. The
    /// invalidation epoch is bumped even when no entry exists, so a dial already
    /// in flight for the tenant discards its result instead of caching it.
    pub fn evict(&self, tenant_id: &str) -> Option<Arc<PoolEntry>> {
        let mut inner = locked(&self.inner);
        inner.bump_invalidation(tenant_id);
        let entry = inner.entries.remove(tenant_id)?;
        entry.set_state(PoolState::Evicted);
        Some(entry)
    }

    /// Remove every entry with no leases whose last use predates `cutoff` by more
    /// than `idle_timeout`. Entries mid-recreation are never touched.
    pub fn evict_idle(&self, idle_timeout: Duration, cutoff: Instant) -> Vec<Arc<PoolEntry>> {
        let mut inner = locked(&self.inner);
        let victims: Vec<String> = inner
            .entries
            .values()
            .filter(|e| {
                e.leases() == 0
                    && !matches!(e.state(), PoolState::Recreating)
                    && locked(&e.last_used)
                        .checked_add(idle_timeout)
                        .map_or(false, |expiry| expiry <= cutoff)
            })
            .map(|e| e.tenant_id.clone())
            .collect();
        victims
            .iter()
            .filter_map(|id| inner.entries.remove(id))
            .inspect(|e| e.set_state(PoolState::Evicted))
            .collect()
    }

    /// Remove all entries (shutdown path). Dials still in flight see their
    /// epoch advanced and discard their pools instead of caching them.
    pub fn drain(&self) -> Vec<Arc<PoolEntry>> {
        let mut inner = locked(&self.inner);
        let tenants: Vec<String> = inner
            .entries
            .keys()
            .chain(inner.creating.iter())
            .cloned()
            .collect();
        for tenant_id in &tenants {
            inner.bump_invalidation(tenant_id);
        }
        inner.creating.clear();
        inner
            .entries
            .drain()
            .map(|(_, e)| {
                e.set_state(PoolState::Evicted);
                e
            })
            .collect()
    }

    /// Entries currently marked healthy, for the liveness probe.
    pub fn healthy_entries(&self) -> Vec<Arc<PoolEntry>> {
        let inner = locked(&self.inner);
        inner
            .entries
            .values()
            .filter(|e| e.is_healthy())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        let inner = locked(&self.inner);
        inner.entries.len() + inner.creating.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of in-flight leases across all entries.
    pub fn total_leases(&self) -> usize {
        locked(&self.inner).entries.values().map(|e| e.leases()).sum()
    }

    pub fn snapshot(&self) -> Vec<PoolStatus> {
        let inner = locked(&self.inner);
        let mut out: Vec<PoolStatus> = inner
            .entries
            .values()
            .map(|e| PoolStatus {
                tenant_id: e.tenant_id.clone(),
                state: e.state().as_str(),
                generation: e.generation(),
                leases: e.leases(),
                idle_secs: e.idle_for().as_secs(),
            })
            .collect();
        out.extend(inner.creating.iter().map(|id| PoolStatus {
            tenant_id: id.clone(),
            state: PoolState::Creating.as_str(),
            generation: 0,
            leases: 0,
            idle_secs: 0,
        }));
        out.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        out
    }

    /// Slow path, caller holds the tenant's creation lock.
    async fn create_locked<F, Fut>(
        &self,
        tenant_id: &str,
        max_pools: usize,
        dial: F,
    ) -> Result<Handle, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PgPool, AppError>>,
    {
        enum Plan<'a> {
            Fresh(CreatingGuard<'a>, u64),
            Recreate(Arc<PoolEntry>),
        }

        // The dial below can be cancelled from outside (resolve timeout, client
        // disconnect); the reservation must not outlive this future.
        struct CreatingGuard<'a> {
            registry: &'a Registry,
            tenant_id: &'a str,
            armed: bool,
        }

        impl Drop for CreatingGuard<'_> {
            fn drop(&mut self) {
                if self.armed {
                    locked(&self.registry.inner).creating.remove(self.tenant_id);
                }
            }
        }

        let mut capacity_victim = None;
        let plan = {
            let mut inner = locked(&self.inner);
            match inner.entries.get(tenant_id) {
                // another caller finished creation while we waited on the lock
                Some(entry) if entry.is_healthy() => return Ok(entry.lease()),
                Some(entry) => {
                    entry.set_state(PoolState::Recreating);
                    Plan::Recreate(entry.clone())
                }
                None => {
                    if inner.entries.len() + inner.creating.len() >= max_pools {
                        match pick_lru_idle(&inner.entries) {
                            Some(victim_id) => {
                                if let Some(victim) = inner.entries.remove(&victim_id) {
                                    victim.set_state(PoolState::Evicted);
                                    capacity_victim = Some(victim);
                                }
                            }
                            None => return Err(AppError::PoolExhausted { max: max_pools }),
                        }
                    }
                    inner.creating.insert(tenant_id.to_string());
                    let epoch = inner.invalidation_epoch(tenant_id);
                    Plan::Fresh(
                        CreatingGuard {
                            registry: self,
                            tenant_id,
                            armed: true,
                        },
                        epoch,
                    )
                }
            }
        };

        if let Some(victim) = capacity_victim {
            tracing::info!(
                tenant_id = %victim.tenant_id(),
                "evicting least-recently-used idle pool to stay under cap"
            );
            victim.close_pool().await;
        }

        match plan {
            Plan::Fresh(mut guard, epoch) => {
                let dialed = dial().await;
                // scope the lock so it is released before any await below;
                // holding a std MutexGuard across an await makes the future !Send
                let cached = {
                    let mut inner = locked(&self.inner);
                    guard.armed = false;
                    inner.creating.remove(tenant_id);
                    let pool = dialed?;
                    if inner.invalidation_epoch(tenant_id) != epoch {
                        // the tenant was invalidated while we were dialing; the
                        // descriptor we dialed with may be stale
                        Err(pool)
                    } else {
                        let generation = self.next_generation();
                        let entry = Arc::new(PoolEntry::new(tenant_id, pool, generation));
                        let handle = entry.lease();
                        inner.entries.insert(tenant_id.to_string(), entry);
                        Ok(handle)
                    }
                };
                match cached {
                    Ok(handle) => Ok(handle),
                    Err(pool) => {
                        pool.close().await;
                        Err(AppError::PoolInvalidated(tenant_id.to_string()))
                    }
                }
            }
            Plan::Recreate(entry) => match dial().await {
                Ok(pool) => {
                    // swap only if this exact entry is still registered; an
                    // eviction during the dial already closed it
                    let swapped = {
                        let inner = locked(&self.inner);
                        let registered = inner
                            .entries
                            .get(tenant_id)
                            .map_or(false, |e| Arc::ptr_eq(e, &entry));
                        if registered {
                            let old = entry.swap_pool(pool, self.next_generation());
                            entry.set_state(PoolState::Healthy);
                            Ok(old)
                        } else {
                            Err(pool)
                        }
                    };
                    match swapped {
                        Ok(old) => {
                            tokio::spawn(async move { old.close().await });
                            Ok(entry.lease())
                        }
                        Err(pool) => {
                            pool.close().await;
                            Err(AppError::PoolInvalidated(tenant_id.to_string()))
                        }
                    }
                }
                Err(e) => {
                    // leave the evicted state alone if an eviction raced us
                    if entry.state() == PoolState::Recreating {
                        entry.set_state(PoolState::Unhealthy);
                    }
                    Err(e)
                }
            },
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn pick_lru_idle(entries: &HashMap<String, Arc<PoolEntry>>) -> Option<String> {
    entries
        .values()
        .filter(|e| e.leases() == 0 && !matches!(e.state(), PoolState::Recreating))
        .min_by_key(|e| *locked(&e.last_used))
        .map(|e| e.tenant_id.clone())
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn lazy_pool(name: &str) -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy(&format!("postgres://localhost/{}", name))
            .expect("valid url")
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_dial() {
        let registry = Arc::new(Registry::new());
        let dials = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let dials = dials.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .get_or_create("acme", 8, || async {
                        dials.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(lazy_pool("acme"))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut generations = Vec::new();
        for t in tasks {
            generations.push(t.await.unwrap().generation());
        }
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert!(generations.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn failed_dial_does_not_poison_the_cache() {
        let registry = Registry::new();
        let err = registry
            .get_or_create("acme", 8, || async {
                Err(AppError::PoolCreationFailed {
                    tenant: "acme".into(),
                    source: sqlx::Error::PoolClosed,
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PoolCreationFailed { .. }));
        assert!(registry.is_empty());

        let handle = registry
            .get_or_create("acme", 8, || async { Ok(lazy_pool("acme")) })
            .await
            .unwrap();
        assert_eq!(handle.tenant_id(), "acme");
    }

    #[tokio::test]
    async fn repeated_acquisition_reuses_the_pool() {
        let registry = Registry::new();
        let a = registry
            .get_or_create("acme", 8, || async { Ok(lazy_pool("acme")) })
            .await
            .unwrap();
        let b = registry
            .get_or_create("acme", 8, || async { panic!("must not dial") })
            .await
            .unwrap();
        assert_eq!(a.generation(), b.generation());
    }

    #[tokio::test]
    async fn eviction_forces_a_fresh_dial() {
        let registry = Registry::new();
        let a = registry
            .get_or_create("acme", 8, || async { Ok(lazy_pool("acme")) })
            .await
            .unwrap();
        let gen_a = a.generation();
        drop(a);

        let evicted = registry.evict("acme").expect("entry present");
        evicted.close_pool().await;

        let b = registry
            .get_or_create("acme", 8, || async { Ok(lazy_pool("acme")) })
            .await
            .unwrap();
        assert_ne!(gen_a, b.generation());
    }

    #[tokio::test]
    async fn cap_evicts_lru_idle_entry() {
        let registry = Registry::new();
        let a = registry
            .get_or_create("a", 2, || async { Ok(lazy_pool("a")) })
            .await
            .unwrap();
        drop(a);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = registry
            .get_or_create("b", 2, || async { Ok(lazy_pool("b")) })
            .await
            .unwrap();
        drop(b);

        // "a" is least recently used; creating "c" at cap 2 must evict it
        let _c = registry
            .get_or_create("c", 2, || async { Ok(lazy_pool("c")) })
            .await
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
    }

    #[tokio::test]
    async fn cap_with_all_pools_busy_is_exhausted() {
        let registry = Registry::new();
        let _a = registry
            .get_or_create("a", 1, || async { Ok(lazy_pool("a")) })
            .await
            .unwrap();
        let err = registry
            .get_or_create("b", 1, || async { Ok(lazy_pool("b")) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PoolExhausted { max: 1 }));
    }

    #[tokio::test]
    async fn idle_sweep_skips_leased_entries() {
        let registry = Registry::new();
        let held = registry
            .get_or_create("held", 8, || async { Ok(lazy_pool("held")) })
            .await
            .unwrap();
        let dropped = registry
            .get_or_create("dropped", 8, || async { Ok(lazy_pool("dropped")) })
            .await
            .unwrap();
        drop(dropped);

        let evicted = registry.evict_idle(Duration::ZERO, Instant::now());
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].tenant_id(), "dropped");
        assert!(registry.get("held").is_some());
        drop(held);
    }

    #[tokio::test]
    async fn eviction_during_dial_discards_the_result() {
        let registry = Registry::new();
        let err = registry
            .get_or_create("acme", 8, || async {
                // an invalidation lands while the dial is still in flight
                assert!(registry.evict("acme").is_none());
                Ok(lazy_pool("acme"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PoolInvalidated(_)));
        assert!(registry.is_empty());

        let handle = registry
            .get_or_create("acme", 8, || async { Ok(lazy_pool("acme")) })
            .await
            .unwrap();
        assert_eq!(handle.tenant_id(), "acme");
    }

    #[tokio::test]
    async fn eviction_during_recreation_does_not_resurrect_the_entry() {
        let registry = Registry::new();
        let a = registry
            .get_or_create("acme", 8, || async { Ok(lazy_pool("acme")) })
            .await
            .unwrap();
        drop(a);
        for entry in registry.healthy_entries() {
            entry.mark_unhealthy();
        }

        let err = registry
            .get_or_create("acme", 8, || async {
                let evicted = registry.evict("acme").expect("entry present");
                evicted.close_pool().await;
                Ok(lazy_pool("acme"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PoolInvalidated(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unhealthy_entry_is_recreated_on_acquire() {
        let registry = Registry::new();
        let a = registry
            .get_or_create("acme", 8, || async { Ok(lazy_pool("acme")) })
            .await
            .unwrap();
        let gen_a = a.generation();
        drop(a);

        for entry in registry.healthy_entries() {
            entry.mark_unhealthy();
        }
        assert!(registry.get("acme").is_none());

        let b = registry
            .get_or_create("acme", 8, || async { Ok(lazy_pool("acme")) })
            .await
            .unwrap();
        assert_ne!(gen_a, b.generation());
        assert!(registry.get("acme").is_some());
    }
}
