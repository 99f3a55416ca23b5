//! Pool manager configuration. All knobs read from env with defaults.

use std::time::Duration;

/// Tuning for the pool lifecycle manager.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Hard cap on simultaneously open tenant pools.
    pub max_pools: usize,
    /// Pools unused this long are evicted by the background sweep.
    pub idle_timeout: Duration,
    /// Interval between idle sweeps.
    pub sweep_interval: Duration,
    /// Interval between liveness probes.
    pub health_interval: Duration,
    /// How long a directory record is served from cache before refetching.
    pub directory_ttl: Duration,
    /// Cap on the combined resolve + create path per request.
    pub resolve_timeout: Duration,
    /// Extra dial attempts after a failed pool creation.
    pub dial_retries: u32,
    /// Base delay between dial attempts, doubled per attempt.
    pub dial_backoff: Duration,
    /// How long shutdown waits for in-flight handles to drain.
    pub shutdown_grace: Duration,
    /// Max connections per tenant pool.
    pub connections_per_pool: u32,
    /// Acquire timeout passed to each tenant pool.
    pub acquire_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            max_pools: 32,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(30),
            directory_ttl: Duration::from_secs(30),
            resolve_timeout: Duration::from_secs(5),
            dial_retries: 2,
            dial_backoff: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(10),
            connections_per_pool: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    /// Build from `TENANCY_*` env vars, falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = ManagerConfig::default();
        ManagerConfig {
            max_pools: env_usize("TENANCY_MAX_POOLS", d.max_pools),
            idle_timeout: env_secs("TENANCY_IDLE_TIMEOUT_SECS", d.idle_timeout),
            sweep_interval: env_secs("TENANCY_SWEEP_INTERVAL_SECS", d.sweep_interval),
            health_interval: env_secs("TENANCY_HEALTH_INTERVAL_SECS", d.health_interval),
            directory_ttl: env_secs("TENANCY_DIRECTORY_TTL_SECS", d.directory_ttl),
            resolve_timeout: env_secs("TENANCY_RESOLVE_TIMEOUT_SECS", d.resolve_timeout),
            dial_retries: env_u32("TENANCY_DIAL_RETRIES", d.dial_retries),
            dial_backoff: env_millis("TENANCY_DIAL_BACKOFF_MS", d.dial_backoff),
            shutdown_grace: env_secs("TENANCY_SHUTDOWN_GRACE_SECS", d.shutdown_grace),
            connections_per_pool: env_u32("TENANCY_CONNECTIONS_PER_POOL", d.connections_per_pool),
            acquire_timeout: env_secs("TENANCY_ACQUIRE_TIMEOUT_SECS", d.acquire_timeout),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
