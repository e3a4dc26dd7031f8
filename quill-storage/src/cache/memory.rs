//! In-memory cache backend.
//!
//! A single `RwLock` over both maps is what makes `put_entry` atomic:
//! payload and dirty marker become visible together or not at all.
//! Expiry is checked lazily on access. The `set_available` switch lets
//! tests exercise the degraded, store-only paths of the tier above.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use quill_core::{CacheError, DraftKey, QuillResult};
use tokio::sync::RwLock;

use super::traits::{CacheBackend, CacheBackendStats, CacheEntry};

#[derive(Debug)]
struct Stored {
    entry: CacheEntry,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<DraftKey, Stored>,
    dirty: HashMap<DraftKey, Instant>,
}

/// In-memory implementation of [`CacheBackend`].
#[derive(Debug)]
pub struct MemoryCacheBackend {
    inner: RwLock<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    available: AtomicBool,
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability. While unavailable every operation returns
    /// `CacheError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> QuillResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable {
                reason: "cache marked unavailable".to_string(),
            }
            .into())
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get_entry(&self, key: &DraftKey) -> QuillResult<Option<CacheEntry>> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        match inner.entries.get(key) {
            Some(stored) if stored.expires_at > now => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(stored.entry.clone()))
            }
            Some(_) => {
                inner.entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put_entry(
        &self,
        key: &DraftKey,
        entry: CacheEntry,
        ttl: Duration,
        mark_dirty: bool,
        dirty_ttl: Duration,
    ) -> QuillResult<()> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.entries.insert(
            key.clone(),
            Stored {
                entry,
                expires_at: now + ttl,
            },
        );
        if mark_dirty {
            inner.dirty.insert(key.clone(), now + dirty_ttl);
        }
        Ok(())
    }

    async fn remove(&self, key: &DraftKey) -> QuillResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let had_entry = inner.entries.remove(key).is_some();
        let had_marker = inner.dirty.remove(key).is_some();
        Ok(had_entry || had_marker)
    }

    async fn is_dirty(&self, key: &DraftKey) -> QuillResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        match inner.dirty.get(key) {
            Some(expires_at) if *expires_at > now => Ok(true),
            Some(_) => {
                inner.dirty.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn clear_dirty(&self, key: &DraftKey) -> QuillResult<()> {
        self.check_available()?;
        self.inner.write().await.dirty.remove(key);
        Ok(())
    }

    async fn refresh_dirty(&self, key: &DraftKey, dirty_ttl: Duration) -> QuillResult<()> {
        self.check_available()?;
        self.inner
            .write()
            .await
            .dirty
            .insert(key.clone(), Instant::now() + dirty_ttl);
        Ok(())
    }

    async fn dirty_keys(&self, limit: usize) -> QuillResult<Vec<DraftKey>> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.dirty.retain(|_, expires_at| *expires_at > now);
        Ok(inner.dirty.keys().take(limit).cloned().collect())
    }

    async fn stats(&self) -> QuillResult<CacheBackendStats> {
        self.check_available()?;
        let now = Instant::now();
        let inner = self.inner.read().await;
        Ok(CacheBackendStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: inner
                .entries
                .values()
                .filter(|s| s.expires_at > now)
                .count() as u64,
            dirty_count: inner
                .dirty
                .values()
                .filter(|expires_at| **expires_at > now)
                .count() as u64,
        })
    }
}
