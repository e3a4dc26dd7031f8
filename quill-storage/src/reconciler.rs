//! Reconciler background task.
//!
//! The reconciler is what makes write-behind saves durable: on a fixed
//! interval it scans the shared cache for dirty markers and flushes each
//! one into the versioned store through the same conditional-write
//! protocol every other writer uses. A conflict leaves the marker in
//! place with a refreshed TTL for the next cycle; one key's failure never
//! aborts the cycle for the others.
//!
//! # Example
//!
//! ```ignore
//! use tokio::sync::watch;
//! use std::sync::Arc;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let metrics = Arc::new(ReconcilerMetrics::new());
//!
//! let handle = tokio::spawn(reconciler_task(
//!     tier.clone(),
//!     ReconcilerConfig::default(),
//!     Arc::clone(&metrics),
//!     shutdown_rx,
//! ));
//!
//! // Later, trigger shutdown and wait for the task to drain.
//! let _ = shutdown_tx.send(true);
//! handle.await.unwrap();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quill_core::EngineConfig;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

use crate::cache::{CacheBackend, CacheTier, FlushOutcome};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the reconciler background task.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to scan for dirty markers (default: 60 seconds)
    pub interval: Duration,

    /// Maximum dirty keys flushed per cycle, so one scan never blocks the
    /// shared cache for long (default: 1000)
    pub batch_size: usize,

    /// Maximum concurrent flushes within one cycle (default: 5)
    pub max_workers: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 1000,
            max_workers: 5,
        }
    }
}

impl ReconcilerConfig {
    /// Derive the reconciler configuration from the engine configuration.
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            interval: config.reconcile_interval,
            batch_size: config.reconcile_batch_size,
            max_workers: config.reconcile_workers.max(1),
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Metrics for reconciliation activity.
#[derive(Debug, Default)]
pub struct ReconcilerMetrics {
    /// Total cycles completed since startup
    pub cycles: AtomicU64,

    /// Dirty entries successfully flushed to the store
    pub flushed: AtomicU64,

    /// Flush attempts that hit a version conflict (marker kept)
    pub conflicts: AtomicU64,

    /// Markers whose payload aged out before persistence
    pub lost: AtomicU64,

    /// Unreadable cached records dropped
    pub corrupt: AtomicU64,

    /// Errors encountered during flushing
    pub errors: AtomicU64,
}

impl ReconcilerMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> ReconcilerSnapshot {
        ReconcilerSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of reconciler metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcilerSnapshot {
    pub cycles: u64,
    pub flushed: u64,
    pub conflicts: u64,
    pub lost: u64,
    pub corrupt: u64,
    pub errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that periodically flushes dirty cache entries.
///
/// Runs until the shutdown signal flips to `true`. Each tick runs one
/// [`reconcile_once`] cycle; missed ticks are skipped rather than bursted.
pub async fn reconciler_task<C: CacheBackend + 'static>(
    tier: Arc<CacheTier<C>>,
    config: ReconcilerConfig,
    metrics: Arc<ReconcilerMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(config.interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval.as_secs_f64(),
        batch_size = config.batch_size,
        max_workers = config.max_workers,
        "Reconciler task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Reconciler task shutting down");
                    break;
                }
            }

            _ = tick.tick() => {
                reconcile_once(&tier, &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        flushed = snapshot.flushed,
        conflicts = snapshot.conflicts,
        lost = snapshot.lost,
        corrupt = snapshot.corrupt,
        errors = snapshot.errors,
        "Reconciler task completed"
    );
}

/// Perform one reconciliation cycle.
///
/// Public so embedders and tests can drive a cycle on demand instead of
/// waiting out the interval.
pub async fn reconcile_once<C: CacheBackend + 'static>(
    tier: &Arc<CacheTier<C>>,
    config: &ReconcilerConfig,
    metrics: &Arc<ReconcilerMetrics>,
) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    let keys = match tier.backend().dirty_keys(config.batch_size).await {
        Ok(keys) => keys,
        Err(e) => {
            tracing::warn!(error = %e, "dirty scan failed, skipping cycle");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    if keys.is_empty() {
        tracing::trace!("Reconcile cycle completed with no dirty entries");
        return;
    }

    tracing::debug!(dirty = keys.len(), "Reconcile cycle starting");

    let semaphore = Arc::new(Semaphore::new(config.max_workers));
    let mut tasks: JoinSet<()> = JoinSet::new();

    for key in keys {
        let tier = Arc::clone(tier);
        let metrics = Arc::clone(metrics);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            match tier.resolve_dirty(&key).await {
                Ok(FlushOutcome::Flushed(version)) => {
                    metrics.flushed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key, version, "reconciled draft");
                }
                Ok(FlushOutcome::Conflict) => {
                    metrics.conflicts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(key = %key, "reconcile conflict, marker kept for next cycle");
                }
                Ok(FlushOutcome::Lost) => {
                    metrics.lost.fetch_add(1, Ordering::Relaxed);
                }
                Ok(FlushOutcome::Corrupt) => {
                    metrics.corrupt.fetch_add(1, Ordering::Relaxed);
                }
                Ok(FlushOutcome::Clean) => {
                    // Cleared concurrently; nothing to do.
                }
                Err(e) => {
                    metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(key = %key, error = %e, "reconcile failed");
                }
            }
        });
    }

    while tasks.join_next().await.is_some() {}

    let snapshot = metrics.snapshot();
    tracing::debug!(
        flushed = snapshot.flushed,
        conflicts = snapshot.conflicts,
        "Reconcile cycle completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::store::{MemoryStore, VersionedStore};
    use quill_core::DraftKey;

    fn key(name: &str) -> DraftKey {
        DraftKey::new(name).expect("valid key")
    }

    struct Fixture {
        tier: Arc<CacheTier<MemoryCacheBackend>>,
        store: Arc<MemoryStore>,
        config: ReconcilerConfig,
        metrics: Arc<ReconcilerMetrics>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryCacheBackend::new());
        let store = Arc::new(MemoryStore::new());
        let tier = Arc::new(CacheTier::new(
            backend,
            store.clone() as Arc<dyn VersionedStore>,
            EngineConfig::development(),
        ));
        Fixture {
            tier,
            store,
            config: ReconcilerConfig {
                interval: Duration::from_millis(10),
                batch_size: 100,
                max_workers: 2,
            },
            metrics: Arc::new(ReconcilerMetrics::new()),
        }
    }

    #[tokio::test]
    async fn test_cycle_flushes_dirty_entries() {
        let f = fixture();
        for i in 0..3 {
            f.tier
                .save(&key(&format!("draft-{i}")), vec![i], None, true)
                .await
                .expect("write-behind");
        }

        reconcile_once(&f.tier, &f.config, &f.metrics).await;

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.flushed, 3);
        assert_eq!(snapshot.errors, 0);
        for i in 0..3u8 {
            let draft = f
                .store
                .get(&key(&format!("draft-{i}")))
                .await
                .expect("persisted");
            assert_eq!(draft.payload, vec![i]);
            assert_eq!(draft.version, 1);
        }
    }

    #[tokio::test]
    async fn test_cycle_with_nothing_dirty_is_a_noop() {
        let f = fixture();
        reconcile_once(&f.tier, &f.config, &f.metrics).await;
        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.cycles, 1);
        assert_eq!(snapshot.flushed, 0);
    }

    #[tokio::test]
    async fn test_conflict_keeps_marker_and_is_isolated() {
        let f = fixture();
        // One entry that cannot flush (orphan version with no store row)
        // and one that can.
        f.tier
            .backend()
            .put_entry(
                &key("orphan"),
                crate::cache::CacheEntry::new(b"x".to_vec(), 9),
                Duration::from_secs(60),
                true,
                Duration::from_secs(60),
            )
            .await
            .expect("put");
        f.tier
            .save(&key("fine"), b"ok".to_vec(), None, true)
            .await
            .expect("write-behind");

        reconcile_once(&f.tier, &f.config, &f.metrics).await;

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.flushed, 1);
        assert_eq!(snapshot.conflicts, 1);
        // The healthy key persisted despite the conflicting one.
        assert!(f.store.exists(&key("fine")).await.expect("exists"));
        assert!(f
            .tier
            .backend()
            .is_dirty(&key("orphan"))
            .await
            .expect("marker kept"));
    }

    #[tokio::test]
    async fn test_task_runs_cycles_and_shuts_down() {
        let f = fixture();
        f.tier
            .save(&key("draft-1"), b"payload".to_vec(), None, true)
            .await
            .expect("write-behind");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reconciler_task(
            Arc::clone(&f.tier),
            f.config.clone(),
            Arc::clone(&f.metrics),
            shutdown_rx,
        ));

        // Give the task a few ticks to flush.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).expect("signal shutdown");
        handle.await.expect("task joins cleanly");

        let snapshot = f.metrics.snapshot();
        assert!(snapshot.cycles >= 1);
        assert_eq!(snapshot.flushed, 1);
        assert!(f.store.exists(&key("draft-1")).await.expect("persisted"));
    }
}
