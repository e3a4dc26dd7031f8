//! LMDB-backed shared cache.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a
//! memory-mapped key-value store shared by every process on the host.
//! LMDB's write transactions are what make the payload/dirty-marker
//! coupling atomic: both keys commit together or not at all.
//!
//! # Key Layout
//!
//! - `entry:<draft-key>` for payload entries
//! - `dirty:<draft-key>` for dirty markers
//!
//! # Value Encoding
//!
//! Entries: `[expires_at_ms: 8][cached_at_ms: 8][version: 8][payload]`,
//! all little-endian. Markers: `[expires_at_ms: 8]`. Expiry is wall-clock
//! milliseconds so every process sharing the environment agrees on it;
//! expired records behave as absent and are deleted lazily on access.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use quill_core::{CacheError, DraftKey, QuillError, QuillResult};

use super::traits::{CacheBackend, CacheBackendStats, CacheEntry};

const ENTRY_PREFIX: &[u8] = b"entry:";
const DIRTY_PREFIX: &[u8] = b"dirty:";
const ENTRY_HEADER_LEN: usize = 24;

fn read_i64(bytes: &[u8]) -> Result<i64, LmdbCacheError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| LmdbCacheError::Decode(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(i64::from_le_bytes(arr))
}

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Stored bytes could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for QuillError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::EnvOpen(reason) | LmdbCacheError::DbOpen(reason) => {
                QuillError::Cache(CacheError::Unavailable { reason })
            }
            LmdbCacheError::Transaction(reason) => {
                QuillError::Cache(CacheError::Transaction { reason })
            }
            LmdbCacheError::Decode(reason) => {
                QuillError::Cache(CacheError::Serialization { reason })
            }
            LmdbCacheError::Io(e) => QuillError::Cache(CacheError::Unavailable {
                reason: e.to_string(),
            }),
        }
    }
}

/// LMDB-backed implementation of [`CacheBackend`].
pub struct LmdbCacheBackend {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LmdbCacheBackend {
    /// Create a new LMDB cache backend.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn entry_key(key: &DraftKey) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ENTRY_PREFIX.len() + key.as_str().len());
        bytes.extend_from_slice(ENTRY_PREFIX);
        bytes.extend_from_slice(key.as_str().as_bytes());
        bytes
    }

    fn dirty_key(key: &DraftKey) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DIRTY_PREFIX.len() + key.as_str().len());
        bytes.extend_from_slice(DIRTY_PREFIX);
        bytes.extend_from_slice(key.as_str().as_bytes());
        bytes
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn encode_entry(entry: &CacheEntry, ttl: Duration) -> Vec<u8> {
        let expires_at = Self::now_ms() + ttl.as_millis() as i64;
        let mut bytes = Vec::with_capacity(ENTRY_HEADER_LEN + entry.payload.len());
        bytes.extend_from_slice(&expires_at.to_le_bytes());
        bytes.extend_from_slice(&entry.cached_at.timestamp_millis().to_le_bytes());
        bytes.extend_from_slice(&entry.version.to_le_bytes());
        bytes.extend_from_slice(&entry.payload);
        bytes
    }

    fn decode_entry(bytes: &[u8]) -> Result<(CacheEntry, i64), LmdbCacheError> {
        if bytes.len() < ENTRY_HEADER_LEN {
            return Err(LmdbCacheError::Decode(format!(
                "entry record too short: {} bytes",
                bytes.len()
            )));
        }
        let expires_at = read_i64(&bytes[0..8])?;
        let cached_at_ms = read_i64(&bytes[8..16])?;
        let version = read_i64(&bytes[16..24])?;
        let cached_at = DateTime::from_timestamp_millis(cached_at_ms)
            .ok_or_else(|| LmdbCacheError::Decode(format!("bad cached_at {cached_at_ms}")))?;
        Ok((
            CacheEntry {
                payload: bytes[ENTRY_HEADER_LEN..].to_vec(),
                version,
                cached_at,
            },
            expires_at,
        ))
    }

    fn encode_marker(dirty_ttl: Duration) -> [u8; 8] {
        (Self::now_ms() + dirty_ttl.as_millis() as i64).to_le_bytes()
    }

    fn decode_marker(bytes: &[u8]) -> Result<i64, LmdbCacheError> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| {
            LmdbCacheError::Decode(format!("marker record has {} bytes", bytes.len()))
        })?;
        Ok(i64::from_le_bytes(arr))
    }

    fn delete_key(&self, raw_key: &[u8]) -> Result<bool, LmdbCacheError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        let deleted = self
            .db
            .delete(&mut wtxn, raw_key)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        Ok(deleted)
    }

    /// Count live records and collect expired ones under a prefix.
    fn scan_prefix(
        &self,
        prefix: &[u8],
        limit: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>), LmdbCacheError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let now = Self::now_ms();
        let mut live = Vec::new();
        let mut expired = Vec::new();

        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        for result in iter {
            let (raw_key, value) =
                result.map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            if raw_key.len() < prefix.len() || &raw_key[..prefix.len()] != prefix {
                continue;
            }
            // Both record kinds lead with an expiry timestamp.
            let expires_at = if value.len() >= 8 {
                read_i64(&value[0..8]).unwrap_or(0)
            } else {
                0
            };
            if expires_at > now {
                if live.len() < limit {
                    live.push(raw_key.to_vec());
                }
            } else {
                expired.push(raw_key.to_vec());
            }
        }
        drop(rtxn);

        if !expired.is_empty() {
            let mut wtxn = self
                .env
                .write_txn()
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            for raw_key in &expired {
                let _ = self.db.delete(&mut wtxn, raw_key);
            }
            wtxn.commit()
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        }

        Ok((live, expired))
    }
}

#[async_trait]
impl CacheBackend for LmdbCacheBackend {
    async fn get_entry(&self, key: &DraftKey) -> QuillResult<Option<CacheEntry>> {
        let raw_key = Self::entry_key(key);
        let decoded = {
            let rtxn = self
                .env
                .read_txn()
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            match self
                .db
                .get(&rtxn, &raw_key)
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
            {
                Some(bytes) => Some(Self::decode_entry(bytes)?),
                None => None,
            }
        };

        match decoded {
            Some((entry, expires_at)) if expires_at > Self::now_ms() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry))
            }
            Some(_) => {
                self.delete_key(&raw_key)?;
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
        let entry_bytes = Self::encode_entry(&entry, ttl);

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        self.db
            .put(&mut wtxn, &Self::entry_key(key), &entry_bytes)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        if mark_dirty {
            self.db
                .put(&mut wtxn, &Self::dirty_key(key), &Self::encode_marker(dirty_ttl))
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        }
        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &DraftKey) -> QuillResult<bool> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        let had_entry = self
            .db
            .delete(&mut wtxn, &Self::entry_key(key))
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        let had_marker = self
            .db
            .delete(&mut wtxn, &Self::dirty_key(key))
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        Ok(had_entry || had_marker)
    }

    async fn is_dirty(&self, key: &DraftKey) -> QuillResult<bool> {
        let raw_key = Self::dirty_key(key);
        let expires_at = {
            let rtxn = self
                .env
                .read_txn()
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            match self
                .db
                .get(&rtxn, &raw_key)
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
            {
                Some(bytes) => Some(Self::decode_marker(bytes)?),
                None => None,
            }
        };

        match expires_at {
            Some(expires_at) if expires_at > Self::now_ms() => Ok(true),
            Some(_) => {
                self.delete_key(&raw_key)?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn clear_dirty(&self, key: &DraftKey) -> QuillResult<()> {
        self.delete_key(&Self::dirty_key(key))?;
        Ok(())
    }

    async fn refresh_dirty(&self, key: &DraftKey, dirty_ttl: Duration) -> QuillResult<()> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        self.db
            .put(&mut wtxn, &Self::dirty_key(key), &Self::encode_marker(dirty_ttl))
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn dirty_keys(&self, limit: usize) -> QuillResult<Vec<DraftKey>> {
        let (live, _) = self.scan_prefix(DIRTY_PREFIX, limit)?;
        let mut keys = Vec::with_capacity(live.len());
        for raw_key in live {
            let name = std::str::from_utf8(&raw_key[DIRTY_PREFIX.len()..]).map_err(|e| {
                LmdbCacheError::Decode(format!("non-UTF8 dirty key: {e}"))
            })?;
            match DraftKey::new(name) {
                Ok(key) => keys.push(key),
                Err(_) => {
                    tracing::warn!(raw = name, "skipping unusable dirty key");
                }
            }
        }
        Ok(keys)
    }

    async fn stats(&self) -> QuillResult<CacheBackendStats> {
        let (entries, _) = self.scan_prefix(ENTRY_PREFIX, usize::MAX)?;
        let (dirty, _) = self.scan_prefix(DIRTY_PREFIX, usize::MAX)?;
        Ok(CacheBackendStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: entries.len() as u64,
            dirty_count: dirty.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_backend() -> (LmdbCacheBackend, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let backend =
            LmdbCacheBackend::new(temp_dir.path(), 10).expect("backend creation should succeed");
        (backend, temp_dir)
    }

    fn key(name: &str) -> DraftKey {
        DraftKey::new(name).expect("valid key")
    }

    const TTL: Duration = Duration::from_secs(60);
    const DIRTY_TTL: Duration = Duration::from_secs(120);

    #[tokio::test]
    async fn test_put_and_get() {
        let (backend, _temp_dir) = create_test_backend();
        let k = key("draft-1");
        let entry = CacheEntry::new(b"payload".to_vec(), 3);

        backend
            .put_entry(&k, entry.clone(), TTL, false, DIRTY_TTL)
            .await
            .expect("put should succeed");

        let cached = backend
            .get_entry(&k)
            .await
            .expect("get should succeed")
            .expect("entry should be present");
        assert_eq!(cached.payload, b"payload");
        assert_eq!(cached.version, 3);
        // Millisecond-precision round trip.
        assert!((entry.cached_at - cached.cached_at).num_seconds().abs() < 1);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (backend, _temp_dir) = create_test_backend();
        assert!(backend
            .get_entry(&key("ghost"))
            .await
            .expect("get should succeed")
            .is_none());
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let (backend, _temp_dir) = create_test_backend();
        let k = key("draft-1");

        backend
            .put_entry(
                &k,
                CacheEntry::new(b"p".to_vec(), 1),
                Duration::from_millis(5),
                true,
                DIRTY_TTL,
            )
            .await
            .expect("put should succeed");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(backend.get_entry(&k).await.expect("get").is_none());
        // The longer-lived dirty marker is still there.
        assert!(backend.is_dirty(&k).await.expect("is_dirty"));
    }

    #[tokio::test]
    async fn test_dirty_marker_lifecycle() {
        let (backend, _temp_dir) = create_test_backend();
        let k = key("draft-1");

        backend
            .put_entry(&k, CacheEntry::new(b"p".to_vec(), 1), TTL, true, DIRTY_TTL)
            .await
            .expect("put should succeed");
        assert!(backend.is_dirty(&k).await.expect("is_dirty"));
        assert_eq!(backend.dirty_keys(10).await.expect("scan"), vec![k.clone()]);

        backend.clear_dirty(&k).await.expect("clear");
        assert!(!backend.is_dirty(&k).await.expect("is_dirty"));
        assert!(backend.dirty_keys(10).await.expect("scan").is_empty());

        backend.refresh_dirty(&k, DIRTY_TTL).await.expect("refresh");
        assert!(backend.is_dirty(&k).await.expect("is_dirty"));
    }

    #[tokio::test]
    async fn test_remove_clears_both() {
        let (backend, _temp_dir) = create_test_backend();
        let k = key("draft-1");

        backend
            .put_entry(&k, CacheEntry::new(b"p".to_vec(), 1), TTL, true, DIRTY_TTL)
            .await
            .expect("put should succeed");
        assert!(backend.remove(&k).await.expect("remove"));
        assert!(backend.get_entry(&k).await.expect("get").is_none());
        assert!(!backend.is_dirty(&k).await.expect("is_dirty"));
        assert!(!backend.remove(&k).await.expect("second remove"));
    }

    #[tokio::test]
    async fn test_dirty_scan_skips_expired_markers() {
        let (backend, _temp_dir) = create_test_backend();

        backend
            .put_entry(
                &key("short"),
                CacheEntry::new(b"a".to_vec(), 1),
                TTL,
                true,
                Duration::from_millis(5),
            )
            .await
            .expect("put");
        backend
            .put_entry(
                &key("long"),
                CacheEntry::new(b"b".to_vec(), 1),
                TTL,
                true,
                DIRTY_TTL,
            )
            .await
            .expect("put");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let keys = backend.dirty_keys(10).await.expect("scan");
        assert_eq!(keys, vec![key("long")]);
    }

    #[tokio::test]
    async fn test_stats() {
        let (backend, _temp_dir) = create_test_backend();
        let k = key("draft-1");

        let _ = backend.get_entry(&k).await; // miss
        backend
            .put_entry(&k, CacheEntry::new(b"p".to_vec(), 1), TTL, true, DIRTY_TTL)
            .await
            .expect("put");
        let _ = backend.get_entry(&k).await; // hit
        let _ = backend.get_entry(&k).await; // hit

        let stats = backend.stats().await.expect("stats");
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.dirty_count, 1);
    }
}
