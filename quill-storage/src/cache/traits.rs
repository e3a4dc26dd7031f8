//! Cache backend trait and entry types.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quill_core::{DraftKey, QuillResult};
use serde::Serialize;

/// A cached draft payload with its optimistic version.
///
/// `version` is the version the payload *will have* once persisted: for a
/// write-through save it matches the store immediately; for a write-behind
/// save it runs ahead of the store until the reconciler flushes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub payload: Vec<u8>,
    pub version: i64,
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(payload: Vec<u8>, version: i64) -> Self {
        Self {
            payload,
            version,
            cached_at: Utc::now(),
        }
    }
}

/// Statistics about cache backend usage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheBackendStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of live (unexpired) entries.
    pub entry_count: u64,
    /// Number of live dirty markers.
    pub dirty_count: u64,
}

impl CacheBackendStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Shared cache backend.
///
/// Implementations must be safe for concurrent use and must make
/// [`put_entry`](CacheBackend::put_entry) atomic across the payload entry
/// and the dirty marker: a reader never observes one without the other.
/// Expired entries and markers behave as absent.
///
/// Backend outages surface as `CacheError::Unavailable`; the tier above
/// treats those as a cue to degrade, not as operation failures.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get the live entry for a key, if present and unexpired.
    async fn get_entry(&self, key: &DraftKey) -> QuillResult<Option<CacheEntry>>;

    /// Write an entry under `ttl` and, when `mark_dirty` is set, its dirty
    /// marker under `dirty_ttl`, in one atomic transaction.
    async fn put_entry(
        &self,
        key: &DraftKey,
        entry: CacheEntry,
        ttl: Duration,
        mark_dirty: bool,
        dirty_ttl: Duration,
    ) -> QuillResult<()>;

    /// Remove the entry and its dirty marker. Returns true if either
    /// existed.
    async fn remove(&self, key: &DraftKey) -> QuillResult<bool>;

    /// Whether a live dirty marker exists for the key.
    async fn is_dirty(&self, key: &DraftKey) -> QuillResult<bool>;

    /// Clear the dirty marker, leaving the entry in place.
    async fn clear_dirty(&self, key: &DraftKey) -> QuillResult<()>;

    /// Set or refresh the dirty marker with a fresh TTL.
    async fn refresh_dirty(&self, key: &DraftKey, dirty_ttl: Duration) -> QuillResult<()>;

    /// Enumerate up to `limit` keys with live dirty markers.
    async fn dirty_keys(&self, limit: usize) -> QuillResult<Vec<DraftKey>>;

    /// Get usage statistics.
    async fn stats(&self) -> QuillResult<CacheBackendStats>;
}
