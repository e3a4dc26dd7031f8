//! In-memory versioned store.
//!
//! The reference implementation of [`VersionedStore`]: a pair of maps
//! behind a single lock, used by tests and by deployments that want the
//! engine without a relational database. The `set_available` switch lets
//! tests exercise the store-outage paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use quill_core::{
    Draft, DraftKey, DraftSummary, HistoryEntry, QuillResult, StoreError, SummaryPage,
};

use super::{clamp_page, VersionedStore};

/// In-memory store: rows plus per-key history vectors.
#[derive(Debug)]
pub struct MemoryStore {
    rows: Arc<RwLock<HashMap<DraftKey, Draft>>>,
    history: Arc<RwLock<HashMap<DraftKey, Vec<HistoryEntry>>>>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self {
            rows: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(HashMap::new())),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability. While unavailable every operation returns
    /// `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Clear all rows and history.
    pub fn clear(&self) {
        self.rows.write().unwrap().clear();
        self.history.write().unwrap().clear();
    }

    /// Number of rows, tombstoned included.
    pub fn row_count(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    /// Number of archived history entries for a key.
    pub fn history_count(&self, key: &DraftKey) -> usize {
        self.history
            .read()
            .unwrap()
            .get(key)
            .map(|h| h.len())
            .unwrap_or(0)
    }

    fn check_available(&self) -> QuillResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: "store marked unavailable".to_string(),
            }
            .into())
        }
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn save(
        &self,
        key: &DraftKey,
        payload: Vec<u8>,
        expected_version: Option<i64>,
    ) -> QuillResult<i64> {
        self.check_available()?;
        let now = Utc::now();
        let mut rows = self.rows.write().unwrap();

        match rows.get_mut(key) {
            None => {
                if let Some(expected) = expected_version {
                    // Conditional writes require the row to exist.
                    return Err(StoreError::VersionConflict {
                        key: key.clone(),
                        expected,
                    }
                    .into());
                }
                rows.insert(
                    key.clone(),
                    Draft {
                        key: key.clone(),
                        version: 1,
                        payload,
                        tombstoned: false,
                        created_at: now,
                        updated_at: now,
                        accessed_at: now,
                    },
                );
                Ok(1)
            }
            Some(row) => {
                if let Some(expected) = expected_version {
                    if row.version != expected {
                        return Err(StoreError::VersionConflict {
                            key: key.clone(),
                            expected,
                        }
                        .into());
                    }
                }
                self.history
                    .write()
                    .unwrap()
                    .entry(key.clone())
                    .or_default()
                    .push(HistoryEntry {
                        key: key.clone(),
                        version: row.version,
                        payload: std::mem::take(&mut row.payload),
                        archived_at: now,
                    });
                row.payload = payload;
                row.version += 1;
                row.tombstoned = false;
                row.updated_at = now;
                Ok(row.version)
            }
        }
    }

    async fn get(&self, key: &DraftKey) -> QuillResult<Draft> {
        self.check_available()?;
        let mut rows = self.rows.write().unwrap();
        match rows.get_mut(key) {
            Some(row) if !row.tombstoned => {
                row.accessed_at = Utc::now();
                Ok(row.clone())
            }
            _ => Err(StoreError::NotFound { key: key.clone() }.into()),
        }
    }

    async fn get_version(&self, key: &DraftKey, version: i64) -> QuillResult<Vec<u8>> {
        self.check_available()?;
        if let Some(entries) = self.history.read().unwrap().get(key) {
            if let Some(entry) = entries.iter().find(|e| e.version == version) {
                return Ok(entry.payload.clone());
            }
        }
        // Not in history; serve from the live row when it is the current
        // version.
        let rows = self.rows.read().unwrap();
        match rows.get(key) {
            Some(row) if !row.tombstoned && row.version == version => Ok(row.payload.clone()),
            _ => Err(StoreError::NotFound { key: key.clone() }.into()),
        }
    }

    async fn exists(&self, key: &DraftKey) -> QuillResult<bool> {
        self.check_available()?;
        let rows = self.rows.read().unwrap();
        Ok(rows.get(key).map(|r| !r.tombstoned).unwrap_or(false))
    }

    async fn delete(&self, key: &DraftKey) -> QuillResult<bool> {
        self.check_available()?;
        let mut rows = self.rows.write().unwrap();
        match rows.get_mut(key) {
            Some(row) => {
                row.tombstoned = true;
                row.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_summaries(&self, page: usize, page_size: usize) -> QuillResult<SummaryPage> {
        self.check_available()?;
        let (page, page_size) = clamp_page(page, page_size);
        let rows = self.rows.read().unwrap();

        let mut live: Vec<&Draft> = rows.values().filter(|r| !r.tombstoned).collect();
        live.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let total_count = live.len();
        let offset = (page - 1) * page_size;
        let summaries = live
            .into_iter()
            .skip(offset)
            .take(page_size)
            .map(|r| DraftSummary {
                key: r.key.clone(),
                version: r.version,
                size_bytes: r.payload.len(),
                created_at: r.created_at,
                updated_at: r.updated_at,
            })
            .collect();

        Ok(SummaryPage::new(summaries, page, page_size, total_count))
    }

    async fn count(&self, include_tombstoned: bool) -> QuillResult<u64> {
        self.check_available()?;
        let rows = self.rows.read().unwrap();
        let count = if include_tombstoned {
            rows.len()
        } else {
            rows.values().filter(|r| !r.tombstoned).count()
        };
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use quill_core::QuillError;

    fn key(name: &str) -> DraftKey {
        DraftKey::new(name).expect("valid key")
    }

    #[tokio::test]
    async fn test_first_save_creates_version_one() {
        let store = MemoryStore::new();
        let k = key("draft-1");

        let version = store
            .save(&k, b"v1".to_vec(), None)
            .await
            .expect("save should succeed");
        assert_eq!(version, 1);

        let draft = store.get(&k).await.expect("get should succeed");
        assert_eq!(draft.version, 1);
        assert_eq!(draft.payload, b"v1");
        assert!(!draft.tombstoned);
    }

    #[tokio::test]
    async fn test_versions_increase_by_exactly_one() {
        let store = MemoryStore::new();
        let k = key("draft-1");

        for expected in 1..=5 {
            let version = store
                .save(
                    &k,
                    format!("payload-{expected}").into_bytes(),
                    if expected == 1 { None } else { Some(expected - 1) },
                )
                .await
                .expect("save should succeed");
            assert_eq!(version, expected);
        }
    }

    #[tokio::test]
    async fn test_conditional_save_wrong_version_is_noop() {
        let store = MemoryStore::new();
        let k = key("draft-1");
        store.save(&k, b"v1".to_vec(), None).await.expect("save");

        let err = store
            .save(&k, b"v2".to_vec(), Some(7))
            .await
            .expect_err("stale version must conflict");
        assert!(err.is_version_conflict());

        // No side effects: payload, version, and history untouched.
        let draft = store.get(&k).await.expect("get");
        assert_eq!(draft.version, 1);
        assert_eq!(draft.payload, b"v1");
        assert_eq!(store.history_count(&k), 0);
    }

    #[tokio::test]
    async fn test_conditional_save_missing_key_conflicts() {
        let store = MemoryStore::new();
        let err = store
            .save(&key("ghost"), b"x".to_vec(), Some(1))
            .await
            .expect_err("missing key must conflict");
        assert!(err.is_version_conflict());
    }

    #[tokio::test]
    async fn test_history_complete_after_overwrites() {
        let store = MemoryStore::new();
        let k = key("draft-1");

        store.save(&k, b"one".to_vec(), None).await.expect("save");
        store.save(&k, b"two".to_vec(), Some(1)).await.expect("save");
        store
            .save(&k, b"three".to_vec(), Some(2))
            .await
            .expect("save");

        assert_eq!(store.get_version(&k, 1).await.expect("v1"), b"one");
        assert_eq!(store.get_version(&k, 2).await.expect("v2"), b"two");
        // Current version served from the live row, not history.
        assert_eq!(store.get_version(&k, 3).await.expect("v3"), b"three");
        assert_eq!(store.history_count(&k), 2);

        let err = store
            .get_version(&k, 4)
            .await
            .expect_err("future version is not found");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_tombstone_hides_and_save_resurrects() {
        let store = MemoryStore::new();
        let k = key("draft-1");
        store.save(&k, b"v1".to_vec(), None).await.expect("save");

        assert!(store.delete(&k).await.expect("delete"));
        assert!(!store.exists(&k).await.expect("exists"));
        assert!(store.get(&k).await.expect_err("hidden").is_not_found());
        // Deleting again still reports the row (it exists, tombstoned).
        assert!(store.delete(&k).await.expect("delete"));

        let version = store
            .save(&k, b"v2".to_vec(), None)
            .await
            .expect("resurrecting save");
        assert_eq!(version, 2);
        assert!(store.exists(&k).await.expect("exists"));
        assert_eq!(store.get(&k).await.expect("get").payload, b"v2");
    }

    #[tokio::test]
    async fn test_delete_absent_returns_false() {
        let store = MemoryStore::new();
        assert!(!store.delete(&key("ghost")).await.expect("delete"));
    }

    #[tokio::test]
    async fn test_list_summaries_orders_and_paginates() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let k = key(&format!("draft-{i}"));
            store.save(&k, vec![0u8; i + 1], None).await.expect("save");
            // Distinct updated_at ordering.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        store.delete(&key("draft-2")).await.expect("delete");

        let page = store.list_summaries(1, 2).await.expect("list");
        assert_eq!(page.total_count, 4);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.summaries.len(), 2);
        // Most recently updated first.
        assert_eq!(page.summaries[0].key.as_str(), "draft-4");
        assert_eq!(page.summaries[1].key.as_str(), "draft-3");
        assert!(page.has_next);
        assert!(!page.has_prev);

        let last = store.list_summaries(2, 2).await.expect("list");
        assert_eq!(last.summaries.len(), 2);
        assert!(!last.has_next);
        assert!(last.has_prev);
    }

    #[tokio::test]
    async fn test_unavailable_store_reports_outage_not_conflict() {
        let store = MemoryStore::new();
        let k = key("draft-1");
        store.save(&k, b"v1".to_vec(), None).await.expect("save");

        store.set_available(false);
        let err = store
            .save(&k, b"v2".to_vec(), Some(1))
            .await
            .expect_err("unavailable");
        assert!(matches!(
            err,
            QuillError::Store(StoreError::Unavailable { .. })
        ));
        assert!(!err.is_version_conflict());

        store.set_available(true);
        assert_eq!(
            store.save(&k, b"v2".to_vec(), Some(1)).await.expect("save"),
            2
        );
    }

    #[tokio::test]
    async fn test_count_excludes_tombstoned() {
        let store = MemoryStore::new();
        store
            .save(&key("a"), b"1".to_vec(), None)
            .await
            .expect("save");
        store
            .save(&key("b"), b"2".to_vec(), None)
            .await
            .expect("save");
        store.delete(&key("a")).await.expect("delete");

        assert_eq!(store.count(false).await.expect("count"), 1);
        assert_eq!(store.count(true).await.expect("count"), 2);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        /// Pagination math holds for arbitrary row counts and page
        /// requests: pages tile the listing without gaps or overlap.
        #[test]
        fn prop_list_summaries_pagination(rows in 0usize..40, page in 0usize..8, page_size in 0usize..12) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            rt.block_on(async {
                let store = MemoryStore::new();
                for i in 0..rows {
                    store
                        .save(&key(&format!("draft-{i}")), vec![0u8; 4], None)
                        .await
                        .expect("save");
                }

                let result = store.list_summaries(page, page_size).await.expect("list");
                prop_assert_eq!(result.total_count, rows);
                prop_assert!(result.page >= 1);
                prop_assert!(result.page_size >= 1);
                prop_assert!(result.summaries.len() <= result.page_size);
                let offset = (result.page - 1) * result.page_size;
                let expected_len = rows.saturating_sub(offset).min(result.page_size);
                prop_assert_eq!(result.summaries.len(), expected_len);
                Ok(())
            })?;
        }
    }
}
