//! Draft entities: the live versioned row, archived history snapshots,
//! and the projections handed to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::DraftKey;

/// The live row for a draft: an opaque payload plus its version fence.
///
/// The engine never inspects `payload`; it is whatever serialized document
/// the caller stores. `version` starts at 1 on first save and increases by
/// exactly 1 per successful conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    /// Externally supplied (or generated), globally unique identifier.
    pub key: DraftKey,
    /// Current version; the fence for conditional writes.
    pub version: i64,
    /// Opaque serialized document.
    pub payload: Vec<u8>,
    /// Soft-delete flag; cleared again by the next successful save.
    pub tombstoned: bool,
    /// When the row was first created.
    pub created_at: DateTime<Utc>,
    /// When the row was last overwritten.
    pub updated_at: DateTime<Utc>,
    /// When the row was last read.
    pub accessed_at: DateTime<Utc>,
}

/// An immutable snapshot of a prior version, archived on every overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub key: DraftKey,
    /// The version being archived (the previous current version).
    pub version: i64,
    pub payload: Vec<u8>,
    pub archived_at: DateTime<Utc>,
}

/// Metadata projection of a draft for listings; omits the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftSummary {
    pub key: DraftKey,
    pub version: i64,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One page of draft summaries, newest-updated first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryPage {
    pub summaries: Vec<DraftSummary>,
    /// 1-indexed page number.
    pub page: usize,
    pub page_size: usize,
    pub total_count: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

impl SummaryPage {
    /// Build a page envelope from an already-sliced window of summaries.
    pub fn new(
        summaries: Vec<DraftSummary>,
        page: usize,
        page_size: usize,
        total_count: usize,
    ) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total_count.div_ceil(page_size)
        };
        Self {
            summaries,
            page,
            page_size,
            total_count,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }

    /// An empty page, used when the requested page is past the end.
    pub fn empty(page: usize, page_size: usize, total_count: usize) -> Self {
        Self::new(Vec::new(), page, page_size, total_count)
    }
}

/// A payload+version pair as read back through the cache tier, carrying
/// the instant it was cached so callers can reason about staleness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDraft {
    pub payload: Vec<u8>,
    pub version: i64,
    pub cached_at: DateTime<Utc>,
}

impl CachedDraft {
    pub fn new(payload: Vec<u8>, version: i64) -> Self {
        Self {
            payload,
            version,
            cached_at: Utc::now(),
        }
    }

    /// Split into the (payload, version) pair most callers want.
    pub fn into_parts(self) -> (Vec<u8>, i64) {
        (self.payload, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(n: i64) -> DraftSummary {
        DraftSummary {
            key: DraftKey::new(&format!("draft-{n}")).expect("valid key"),
            version: n,
            size_bytes: 16,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_summary_page_math() {
        let page = SummaryPage::new(vec![summary(1), summary(2)], 1, 2, 5);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_next);
        assert!(!page.has_prev);

        let last = SummaryPage::new(vec![summary(5)], 3, 2, 5);
        assert!(!last.has_next);
        assert!(last.has_prev);
    }

    #[test]
    fn test_summary_page_empty() {
        let page = SummaryPage::empty(7, 10, 3);
        assert!(page.summaries.is_empty());
        assert_eq!(page.total_pages, 1);
        assert!(!page.has_next);
        assert!(page.has_prev);
    }

    #[test]
    fn test_cached_draft_into_parts() {
        let cached = CachedDraft::new(b"payload".to_vec(), 4);
        let (payload, version) = cached.into_parts();
        assert_eq!(payload, b"payload");
        assert_eq!(version, 4);
    }
}
