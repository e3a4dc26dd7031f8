//! Draft engine facade.
//!
//! One `DraftEngine` owns everything a process needs to work with drafts:
//! the cache tier, the per-key mutation queue, the update coordinator,
//! and the reconciler background task. There is no ambient global state;
//! construct an engine at startup and hand it around by reference.

use std::sync::Arc;

use futures_util::FutureExt;
use quill_core::{DraftKey, EngineConfig, QuillResult, SummaryPage};
use quill_storage::{
    reconciler_task, CacheBackend, CacheTier, ReconcilerConfig, ReconcilerMetrics,
    ReconcilerSnapshot, TierStats, VersionedStore,
};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::coordinator::{Mutator, UpdateCoordinator, UpdateOutcome};
use crate::queue::{MutationQueue, QueueConfig, QueueStats};

/// Combined engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub cache: TierStats,
    pub queue: QueueStats,
    pub reconciler: ReconcilerSnapshot,
}

/// The draft consistency and caching engine.
///
/// # Example
///
/// ```ignore
/// let backend = Arc::new(MemoryCacheBackend::new());
/// let store: Arc<dyn VersionedStore> = Arc::new(MemoryStore::new());
/// let engine = DraftEngine::new(EngineConfig::default(), backend, store);
///
/// let key = engine.create(b"{}".to_vec()).await?;
/// engine
///     .update_with_retry(&key, Arc::new(|doc| Ok(doc.to_vec())), None)
///     .await?;
/// engine.shutdown().await;
/// ```
pub struct DraftEngine<C: CacheBackend + 'static> {
    tier: Arc<CacheTier<C>>,
    coordinator: Arc<UpdateCoordinator<C>>,
    queue: MutationQueue,
    config: EngineConfig,
    reconciler_metrics: Arc<ReconcilerMetrics>,
    shutdown_tx: watch::Sender<bool>,
    reconciler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C: CacheBackend + 'static> DraftEngine<C> {
    /// Create an engine and start its background tasks.
    ///
    /// Must be called inside a Tokio runtime: the reconciler and the
    /// queue sweep are spawned here and run until [`shutdown`].
    ///
    /// [`shutdown`]: DraftEngine::shutdown
    pub fn new(config: EngineConfig, backend: Arc<C>, store: Arc<dyn VersionedStore>) -> Self {
        let tier = Arc::new(CacheTier::new(backend, store, config.clone()));
        let coordinator = Arc::new(UpdateCoordinator::new(
            Arc::clone(&tier),
            config.retry_base_delay,
        ));
        let queue = MutationQueue::new(QueueConfig::from_engine(&config));

        let reconciler_metrics = Arc::new(ReconcilerMetrics::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler_handle = tokio::spawn(reconciler_task(
            Arc::clone(&tier),
            ReconcilerConfig::from_engine(&config),
            Arc::clone(&reconciler_metrics),
            shutdown_rx,
        ));

        tracing::info!(
            cache_ttl_secs = config.cache_ttl.as_secs(),
            reconcile_interval_secs = config.reconcile_interval.as_secs_f64(),
            max_retries = config.max_retries,
            "Draft engine started"
        );

        Self {
            tier,
            coordinator,
            queue,
            config,
            reconciler_metrics,
            shutdown_tx,
            reconciler_handle: Mutex::new(Some(reconciler_handle)),
        }
    }

    /// The cache tier, for embedders that need lower-level access.
    pub fn tier(&self) -> &Arc<CacheTier<C>> {
        &self.tier
    }

    /// Create a new draft with a generated key.
    ///
    /// The save is write-behind: it is accepted once the shared cache
    /// commits, and the reconciler (or the next versioned read) persists
    /// it to the store.
    pub async fn create(&self, initial_payload: Vec<u8>) -> QuillResult<DraftKey> {
        let key = DraftKey::generate();
        self.create_with_key(&key, initial_payload).await?;
        Ok(key)
    }

    /// Create a draft under a caller-supplied key. Returns the initial
    /// version (1). A tombstoned draft under the same key is resurrected
    /// when the save reaches the store.
    pub async fn create_with_key(
        &self,
        key: &DraftKey,
        initial_payload: Vec<u8>,
    ) -> QuillResult<i64> {
        let version = self.tier.save(key, initial_payload, None, true).await?;
        tracing::info!(key = %key, version, "draft created");
        Ok(version)
    }

    /// Read the current payload.
    pub async fn read(&self, key: &DraftKey) -> QuillResult<Vec<u8>> {
        Ok(self.tier.get(key).await?.payload)
    }

    /// Read the current payload together with its version.
    pub async fn read_with_version(&self, key: &DraftKey) -> QuillResult<(Vec<u8>, i64)> {
        self.tier.get_with_version(key).await
    }

    /// Read the payload of a specific historical (or current) version.
    pub async fn read_version(&self, key: &DraftKey, version: i64) -> QuillResult<Vec<u8>> {
        self.tier.store().get_version(key, version).await
    }

    /// Apply a mutation with automatic retry on version conflicts.
    ///
    /// The operation is funneled through the per-key mutation queue, so
    /// callers within this process never race each other for the same
    /// draft; the coordinator's version fencing covers everything else.
    /// `max_retries` defaults to the configured retry budget.
    pub async fn update_with_retry(
        &self,
        key: &DraftKey,
        mutate: Mutator,
        max_retries: Option<u32>,
    ) -> QuillResult<UpdateOutcome> {
        let retries = max_retries.unwrap_or(self.config.max_retries);
        let coordinator = Arc::clone(&self.coordinator);
        let job_key = key.clone();
        let op = async move { coordinator.apply(&job_key, mutate.as_ref(), retries).await }.boxed();
        self.queue.enqueue(key, op).await
    }

    /// Soft-delete a draft. Returns true if any layer held it.
    pub async fn delete(&self, key: &DraftKey) -> QuillResult<bool> {
        let removed = self.tier.delete(key).await?;
        tracing::info!(key = %key, removed, "draft deleted");
        Ok(removed)
    }

    /// Check whether a draft exists (tombstoned drafts do not).
    pub async fn exists(&self, key: &DraftKey) -> QuillResult<bool> {
        self.tier.exists(key).await
    }

    /// List draft summaries, newest-updated first.
    pub async fn list_summaries(&self, page: usize, page_size: usize) -> QuillResult<SummaryPage> {
        self.tier.store().list_summaries(page, page_size).await
    }

    /// Combined statistics across cache, queue, and reconciler.
    pub async fn stats(&self) -> QuillResult<EngineStats> {
        Ok(EngineStats {
            cache: self.tier.stats().await?,
            queue: self.queue.stats().await,
            reconciler: self.reconciler_metrics.snapshot(),
        })
    }

    /// Shut down deterministically: stop the reconciler, then drain the
    /// mutation queue (pending operations surface a cancellation error to
    /// their waiters). Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.reconciler_handle.lock().await.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "reconciler ended abnormally");
                }
            }
        }
        self.queue.shutdown().await;
        tracing::info!("Draft engine shut down");
    }
}
