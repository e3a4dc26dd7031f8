//! Two-level cache tier in front of the versioned store.
//!
//! Reads go shared-cache-first with read-through population. Writes come
//! in two flavors: write-through (an expected version is supplied, the
//! store CAS runs synchronously) and write-behind (no expected version,
//! the save is accepted once the cache transaction commits and the dirty
//! marker hands persistence to the reconciler).
//!
//! Two rules keep the tiers coherent:
//!
//! 1. A dirty marker means the shared cache is ahead of the store. Any
//!    path that needs the true current version (every conditional write)
//!    must resolve the marker first, via [`CacheTier::resolve_dirty`].
//! 2. The process-local map is a pure read accelerator. It is populated
//!    opportunistically, invalidated on every write, and never consulted
//!    for version decisions.
//!
//! A shared-cache outage is not an operation failure: the tier logs it
//! and degrades to store-only behavior until the backend recovers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::RwLock;

use quill_core::{CachedDraft, DraftKey, EngineConfig, QuillResult};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use super::traits::{CacheBackend, CacheEntry};
use crate::store::VersionedStore;

/// Outcome of resolving a dirty marker for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The cached payload was persisted at this version.
    Flushed(i64),
    /// No live dirty marker existed.
    Clean,
    /// The marker outlived its payload; the write-behind data aged out
    /// before it could be persisted. Marker cleared.
    Lost,
    /// The cached record could not be decoded. Entry and marker cleared.
    Corrupt,
    /// The store moved underneath the flush. Marker kept with a fresh TTL
    /// for the next reconciliation cycle.
    Conflict,
}

/// Combined statistics for the tier and the store behind it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub local_entries: usize,
    pub shared_entries: u64,
    pub dirty_count: u64,
    pub hits: u64,
    pub misses: u64,
    pub store_count: u64,
}

/// Bounded process-local read accelerator (FIFO eviction).
#[derive(Debug, Default)]
struct LocalCache {
    map: HashMap<DraftKey, (Vec<u8>, i64)>,
    order: VecDeque<DraftKey>,
    capacity: usize,
}

impl LocalCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, key: &DraftKey) -> Option<(Vec<u8>, i64)> {
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: DraftKey, payload: Vec<u8>, version: i64) {
        if self.capacity == 0 {
            return;
        }
        if self.map.insert(key.clone(), (payload, version)).is_none() {
            self.order.push_back(key);
        }
        while self.map.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn invalidate(&mut self, key: &DraftKey) {
        if self.map.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Two-level cache in front of a [`VersionedStore`].
pub struct CacheTier<C: CacheBackend> {
    backend: Arc<C>,
    store: Arc<dyn VersionedStore>,
    config: EngineConfig,
    local: Arc<RwLock<LocalCache>>,
    /// Per-key guards so concurrent flushes of the same key (reconciler
    /// vs. read path) serialize instead of double-creating a new draft.
    flush_locks: Arc<AsyncMutex<HashMap<DraftKey, Arc<AsyncMutex<()>>>>>,
}

impl<C: CacheBackend> CacheTier<C> {
    pub fn new(backend: Arc<C>, store: Arc<dyn VersionedStore>, config: EngineConfig) -> Self {
        let local = Arc::new(RwLock::new(LocalCache::new(config.local_cache_capacity)));
        Self {
            backend,
            store,
            config,
            local,
            flush_locks: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    /// The shared cache backend.
    pub fn backend(&self) -> &Arc<C> {
        &self.backend
    }

    /// The durable store.
    pub fn store(&self) -> &Arc<dyn VersionedStore> {
        &self.store
    }

    /// The engine configuration this tier was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn local_get(&self, key: &DraftKey) -> Option<(Vec<u8>, i64)> {
        self.local.read().ok().and_then(|l| l.get(key))
    }

    fn local_insert(&self, key: &DraftKey, payload: &[u8], version: i64) {
        if let Ok(mut local) = self.local.write() {
            local.insert(key.clone(), payload.to_vec(), version);
        }
    }

    fn local_invalidate(&self, key: &DraftKey) {
        if let Ok(mut local) = self.local.write() {
            local.invalidate(key);
        }
    }

    /// Get a draft, fastest tier first.
    ///
    /// Order: local map, shared cache, then read-through from the store
    /// (repopulating the shared cache with a fresh TTL). A marker whose
    /// payload has expired is cleared here, since the store is all that is
    /// left to serve the read.
    pub async fn get(&self, key: &DraftKey) -> QuillResult<CachedDraft> {
        if let Some((payload, version)) = self.local_get(key) {
            return Ok(CachedDraft::new(payload, version));
        }

        match self.backend.get_entry(key).await {
            Ok(Some(entry)) => {
                self.local_insert(key, &entry.payload, entry.version);
                return Ok(CachedDraft {
                    payload: entry.payload,
                    version: entry.version,
                    cached_at: entry.cached_at,
                });
            }
            Ok(None) => {
                if self.backend.is_dirty(key).await.unwrap_or(false) {
                    tracing::warn!(
                        key = %key,
                        "write-behind payload aged out before persistence; clearing marker"
                    );
                    let _ = self.backend.clear_dirty(key).await;
                }
            }
            Err(e) if e.is_cache_unavailable() => {
                tracing::warn!(key = %key, error = %e, "shared cache unavailable, reading store directly");
                let draft = self.store.get(key).await?;
                return Ok(CachedDraft::new(draft.payload, draft.version));
            }
            Err(e) => {
                // Undecodable record: drop it and fall through to the store.
                tracing::warn!(key = %key, error = %e, "discarding unreadable cache entry");
                let _ = self.backend.remove(key).await;
            }
        }

        let draft = self.store.get(key).await?;
        self.populate(key, &draft.payload, draft.version).await;
        self.local_insert(key, &draft.payload, draft.version);
        Ok(CachedDraft::new(draft.payload, draft.version))
    }

    /// Get a draft with the version that conditional writes must fence on.
    ///
    /// Resolves any outstanding dirty marker first, so the returned
    /// version reflects (or will become) the store's true current
    /// version. The local map is deliberately skipped.
    pub async fn get_with_version(&self, key: &DraftKey) -> QuillResult<(Vec<u8>, i64)> {
        match self.backend.is_dirty(key).await {
            Ok(true) => match self.resolve_dirty(key).await {
                Ok(outcome) => {
                    tracing::debug!(key = %key, ?outcome, "resolved dirty marker before versioned read");
                }
                Err(e) if e.is_cache_unavailable() => {
                    tracing::warn!(key = %key, error = %e, "shared cache went away mid-flush, reading store directly");
                    let draft = self.store.get(key).await?;
                    return Ok((draft.payload, draft.version));
                }
                Err(e) => return Err(e),
            },
            Ok(false) => {}
            Err(e) if e.is_cache_unavailable() => {
                tracing::warn!(key = %key, error = %e, "shared cache unavailable, reading store directly");
                let draft = self.store.get(key).await?;
                return Ok((draft.payload, draft.version));
            }
            Err(e) => return Err(e),
        }

        match self.backend.get_entry(key).await {
            Ok(Some(entry)) => Ok((entry.payload, entry.version)),
            Ok(None) => {
                let draft = self.store.get(key).await?;
                self.populate(key, &draft.payload, draft.version).await;
                Ok((draft.payload, draft.version))
            }
            Err(e) if e.is_cache_unavailable() => {
                let draft = self.store.get(key).await?;
                Ok((draft.payload, draft.version))
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "discarding unreadable cache entry");
                let _ = self.backend.remove(key).await;
                let draft = self.store.get(key).await?;
                Ok((draft.payload, draft.version))
            }
        }
    }

    /// Save a draft payload through the tier.
    ///
    /// The shared-cache transaction commits first: the new payload under
    /// its TTL plus, when `mark_dirty` is set, the dirty marker under the
    /// longer dirty TTL, atomically.
    ///
    /// With `expected_version = Some(v)` the store CAS then runs
    /// synchronously: success clears the marker and returns the new
    /// version; a conflict refreshes the marker (the reconciler will
    /// retry) and surfaces `VersionConflict`. With `None` the write is
    /// accepted as soon as the cache commits (write-behind).
    ///
    /// When the shared cache is unreachable the tier degrades to writing
    /// the store directly, including for write-behind saves.
    pub async fn save(
        &self,
        key: &DraftKey,
        payload: Vec<u8>,
        expected_version: Option<i64>,
        mark_dirty: bool,
    ) -> QuillResult<i64> {
        let new_version = match expected_version {
            Some(v) => v + 1,
            None => 1,
        };

        let entry = CacheEntry::new(payload.clone(), new_version);
        let cache_ok = match self
            .backend
            .put_entry(
                key,
                entry,
                self.config.cache_ttl,
                mark_dirty,
                self.config.dirty_ttl(),
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache write failed, falling back to store-only save");
                false
            }
        };

        // Another process may have advanced the draft; force the next local
        // read to refresh through the shared tiers.
        self.local_invalidate(key);

        match expected_version {
            Some(expected) => match self.store.save(key, payload, Some(expected)).await {
                Ok(version) => {
                    if cache_ok {
                        let _ = self.backend.clear_dirty(key).await;
                    }
                    Ok(version)
                }
                Err(e) if e.is_version_conflict() => {
                    if cache_ok {
                        // Leave the marker for the reconciler, with a fresh TTL.
                        let _ = self.backend.refresh_dirty(key, self.config.dirty_ttl()).await;
                    }
                    Err(e)
                }
                Err(e) => Err(e),
            },
            None => {
                if cache_ok {
                    Ok(new_version)
                } else {
                    self.store.save(key, payload, None).await
                }
            }
        }
    }

    /// Delete a draft from every tier. Returns true when either the cache
    /// or the store reported a removal.
    pub async fn delete(&self, key: &DraftKey) -> QuillResult<bool> {
        let cache_removed = match self.backend.remove(key).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache delete failed");
                false
            }
        };
        self.local_invalidate(key);
        let store_removed = self.store.delete(key).await?;
        Ok(cache_removed || store_removed)
    }

    /// Check existence: shared cache presence counts, else the store.
    pub async fn exists(&self, key: &DraftKey) -> QuillResult<bool> {
        match self.backend.get_entry(key).await {
            Ok(Some(_)) => return Ok(true),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache exists check failed, consulting store");
            }
        }
        self.store.exists(key).await
    }

    /// Flush one key's write-behind state into the store.
    ///
    /// This is the single conditional-write path shared by the read side
    /// (marker resolution) and the reconciler. The store's current version
    /// is read immediately before the CAS; a missing row is created
    /// unconditionally only when the cached version is 1 (a new draft's
    /// first flush), and is otherwise a conflict.
    pub async fn resolve_dirty(&self, key: &DraftKey) -> QuillResult<FlushOutcome> {
        let key_lock = {
            let mut locks = self.flush_locks.lock().await;
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = key_lock.lock().await;
        let outcome = self.resolve_dirty_locked(key).await;
        drop(guard);

        let mut locks = self.flush_locks.lock().await;
        if let Some(existing) = locks.get(key) {
            // Registry + our clone; nobody else is waiting on this key.
            if Arc::strong_count(existing) <= 2 {
                locks.remove(key);
            }
        }
        outcome
    }

    async fn resolve_dirty_locked(&self, key: &DraftKey) -> QuillResult<FlushOutcome> {
        if !self.backend.is_dirty(key).await? {
            return Ok(FlushOutcome::Clean);
        }

        let entry = match self.backend.get_entry(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tracing::warn!(
                    key = %key,
                    "write-behind payload aged out before persistence; clearing marker"
                );
                self.backend.clear_dirty(key).await?;
                return Ok(FlushOutcome::Lost);
            }
            Err(e) if e.is_cache_unavailable() => return Err(e),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "unreadable write-behind record; dropping it");
                let _ = self.backend.remove(key).await;
                return Ok(FlushOutcome::Corrupt);
            }
        };

        let expected = match self.store.get(key).await {
            Ok(draft) => Some(draft.version),
            Err(e) if e.is_not_found() => {
                if entry.version == 1 {
                    None
                } else {
                    tracing::warn!(
                        key = %key,
                        cached_version = entry.version,
                        "dirty entry has no store row behind it; keeping marker"
                    );
                    self.backend.refresh_dirty(key, self.config.dirty_ttl()).await?;
                    return Ok(FlushOutcome::Conflict);
                }
            }
            Err(e) => return Err(e),
        };

        match self.store.save(key, entry.payload.clone(), expected).await {
            Ok(version) => {
                self.backend.clear_dirty(key).await?;
                if version != entry.version {
                    // The store had moved past the cached base; republish the
                    // cached payload under its real version.
                    let _ = self
                        .backend
                        .put_entry(
                            key,
                            CacheEntry::new(entry.payload, version),
                            self.config.cache_ttl,
                            false,
                            self.config.dirty_ttl(),
                        )
                        .await;
                    self.local_invalidate(key);
                }
                tracing::debug!(key = %key, version, "flushed write-behind draft");
                Ok(FlushOutcome::Flushed(version))
            }
            Err(e) if e.is_version_conflict() => {
                self.backend.refresh_dirty(key, self.config.dirty_ttl()).await?;
                Ok(FlushOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }

    /// Combined statistics across the tiers and the store.
    pub async fn stats(&self) -> QuillResult<TierStats> {
        let backend_stats = match self.backend.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(error = %e, "cache stats unavailable");
                Default::default()
            }
        };
        let store_count = self.store.count(false).await?;
        Ok(TierStats {
            local_entries: self.local.read().map(|l| l.len()).unwrap_or(0),
            shared_entries: backend_stats.entry_count,
            dirty_count: backend_stats.dirty_count,
            hits: backend_stats.hits,
            misses: backend_stats.misses,
            store_count,
        })
    }

    /// Repopulate the shared cache after a store read; failures only warn.
    async fn populate(&self, key: &DraftKey, payload: &[u8], version: i64) {
        let entry = CacheEntry::new(payload.to_vec(), version);
        if let Err(e) = self
            .backend
            .put_entry(key, entry, self.config.cache_ttl, false, self.config.dirty_ttl())
            .await
        {
            tracing::debug!(key = %key, error = %e, "cache repopulation failed");
        }
    }
}

impl<C: CacheBackend> Clone for CacheTier<C> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            local: Arc::clone(&self.local),
            flush_locks: Arc::clone(&self.flush_locks),
        }
    }
}
