//! Engine configuration.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults. The defaults match the behavior of the production deployment:
//! a 10-minute cache TTL with dirty markers living twice as long, a
//! 60-second reconciliation interval, and a 3-attempt retry budget with a
//! 50 ms doubling backoff.

use std::time::Duration;

const DEFAULT_CACHE_TTL_SECS: u64 = 600;
const DEFAULT_DIRTY_TTL_FACTOR: u32 = 2;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;
const DEFAULT_RECONCILE_BATCH_SIZE: usize = 1000;
const DEFAULT_RECONCILE_WORKERS: usize = 5;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 50;
const DEFAULT_OP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_QUEUE_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_QUEUE_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_LOCAL_CACHE_CAPACITY: usize = 100;

/// Configuration for the draft engine and its background tasks.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TTL for shared-cache payload entries.
    pub cache_ttl: Duration,

    /// Dirty markers live `dirty_ttl_factor` times longer than payloads,
    /// bounding the write-behind data-loss window.
    pub dirty_ttl_factor: u32,

    /// How often the reconciler flushes dirty entries to the store.
    pub reconcile_interval: Duration,

    /// Maximum dirty keys flushed per reconciler cycle.
    pub reconcile_batch_size: usize,

    /// Maximum concurrent flushes within one cycle.
    pub reconcile_workers: usize,

    /// Default retry budget for optimistic updates.
    pub max_retries: u32,

    /// Initial backoff delay between conflict retries (doubles each time).
    pub retry_base_delay: Duration,

    /// Per-operation timeout inside the mutation queue.
    pub op_timeout: Duration,

    /// A per-key worker exits after its queue has been empty this long.
    pub queue_idle_timeout: Duration,

    /// How often the queue sweep removes finished workers.
    pub queue_sweep_interval: Duration,

    /// Capacity of the process-local read accelerator (0 disables it).
    pub local_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            dirty_ttl_factor: DEFAULT_DIRTY_TTL_FACTOR,
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            reconcile_batch_size: DEFAULT_RECONCILE_BATCH_SIZE,
            reconcile_workers: DEFAULT_RECONCILE_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            op_timeout: Duration::from_secs(DEFAULT_OP_TIMEOUT_SECS),
            queue_idle_timeout: Duration::from_secs(DEFAULT_QUEUE_IDLE_TIMEOUT_SECS),
            queue_sweep_interval: Duration::from_secs(DEFAULT_QUEUE_SWEEP_INTERVAL_SECS),
            local_cache_capacity: DEFAULT_LOCAL_CACHE_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Create an EngineConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `QUILL_CACHE_TTL_SECS`: Shared-cache payload TTL (default: 600)
    /// - `QUILL_DIRTY_TTL_FACTOR`: Dirty TTL multiplier (default: 2)
    /// - `QUILL_RECONCILE_INTERVAL_SECS`: Reconciler interval (default: 60)
    /// - `QUILL_RECONCILE_BATCH_SIZE`: Dirty keys per cycle (default: 1000)
    /// - `QUILL_RECONCILE_WORKERS`: Concurrent flushes (default: 5)
    /// - `QUILL_MAX_RETRIES`: Update retry budget (default: 3)
    /// - `QUILL_RETRY_BASE_DELAY_MS`: Initial backoff (default: 50)
    /// - `QUILL_OP_TIMEOUT_SECS`: Per-operation timeout (default: 30)
    /// - `QUILL_QUEUE_IDLE_TIMEOUT_SECS`: Worker idle timeout (default: 300)
    /// - `QUILL_QUEUE_SWEEP_INTERVAL_SECS`: Sweep interval (default: 300)
    /// - `QUILL_LOCAL_CACHE_CAPACITY`: Local map capacity (default: 100)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            cache_ttl: env_secs("QUILL_CACHE_TTL_SECS").unwrap_or(defaults.cache_ttl),
            dirty_ttl_factor: env_parse("QUILL_DIRTY_TTL_FACTOR")
                .unwrap_or(defaults.dirty_ttl_factor),
            reconcile_interval: env_secs("QUILL_RECONCILE_INTERVAL_SECS")
                .unwrap_or(defaults.reconcile_interval),
            reconcile_batch_size: env_parse("QUILL_RECONCILE_BATCH_SIZE")
                .unwrap_or(defaults.reconcile_batch_size),
            reconcile_workers: env_parse("QUILL_RECONCILE_WORKERS")
                .unwrap_or(defaults.reconcile_workers),
            max_retries: env_parse("QUILL_MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_base_delay: std::env::var("QUILL_RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            op_timeout: env_secs("QUILL_OP_TIMEOUT_SECS").unwrap_or(defaults.op_timeout),
            queue_idle_timeout: env_secs("QUILL_QUEUE_IDLE_TIMEOUT_SECS")
                .unwrap_or(defaults.queue_idle_timeout),
            queue_sweep_interval: env_secs("QUILL_QUEUE_SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.queue_sweep_interval),
            local_cache_capacity: env_parse("QUILL_LOCAL_CACHE_CAPACITY")
                .unwrap_or(defaults.local_cache_capacity),
        }
    }

    /// Create a configuration for development/testing with short intervals.
    pub fn development() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5),
            dirty_ttl_factor: 2,
            reconcile_interval: Duration::from_millis(100),
            reconcile_batch_size: 10,
            reconcile_workers: 2,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(5),
            op_timeout: Duration::from_secs(2),
            queue_idle_timeout: Duration::from_millis(200),
            queue_sweep_interval: Duration::from_millis(100),
            local_cache_capacity: 10,
        }
    }

    /// Dirty marker TTL: the payload TTL times the dirty factor.
    pub fn dirty_ttl(&self) -> Duration {
        self.cache_ttl * self.dirty_ttl_factor
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
