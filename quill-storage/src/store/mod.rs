//! Durable versioned store: the source of truth for drafts.
//!
//! The store is a keyed table of (payload, version) rows with an
//! append-only history of prior versions. All mutation goes through
//! [`VersionedStore::save`], whose conditional form is the only
//! cross-process coordination primitive in the engine: a write with
//! `expected_version = Some(v)` commits if and only if the row is at
//! exactly `v` at the instant of the write, and has no side effect
//! otherwise.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use quill_core::{Draft, DraftKey, QuillResult, SummaryPage};

pub use memory::MemoryStore;
pub use postgres::{PgConfig, PostgresStore};

/// Maximum page size accepted by [`VersionedStore::list_summaries`].
pub const MAX_PAGE_SIZE: usize = 1000;

/// Durable store for versioned drafts.
///
/// # Contract
///
/// - Versions start at 1 and increase by exactly 1 per successful save.
/// - Every overwrite archives the prior (payload, version) as a history
///   entry before the row is updated.
/// - Deletes are tombstones: the row and its history survive, and the
///   next successful save resurrects the key.
/// - I/O failures surface as `StoreError::Unavailable`, never as a
///   version conflict.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Save a draft payload.
    ///
    /// With `expected_version = None` this is an unconditional upsert: the
    /// resulting version is `prior + 1` if the key existed (tombstoned or
    /// not), else 1. With `Some(v)` the write is conditional and fails
    /// with `StoreError::VersionConflict` (no row mutation, no history
    /// entry) when the key is absent or its current version differs
    /// from `v`.
    ///
    /// Returns the new current version.
    async fn save(
        &self,
        key: &DraftKey,
        payload: Vec<u8>,
        expected_version: Option<i64>,
    ) -> QuillResult<i64>;

    /// Get the current draft row. Tombstoned drafts are `NotFound`.
    ///
    /// Refreshes the row's `accessed_at` timestamp.
    async fn get(&self, key: &DraftKey) -> QuillResult<Draft>;

    /// Get the payload of a specific version.
    ///
    /// History is consulted first; when the requested version is the
    /// draft's current version the live row serves it instead (history
    /// is never duplicated for the current version).
    async fn get_version(&self, key: &DraftKey, version: i64) -> QuillResult<Vec<u8>>;

    /// Check existence. Tombstoned drafts count as absent.
    async fn exists(&self, key: &DraftKey) -> QuillResult<bool>;

    /// Soft-delete a draft. Returns `false` when the key is absent.
    async fn delete(&self, key: &DraftKey) -> QuillResult<bool>;

    /// List summaries of non-tombstoned drafts, most recently updated
    /// first. `page` is 1-indexed; `page_size` is clamped to
    /// `1..=MAX_PAGE_SIZE`.
    async fn list_summaries(&self, page: usize, page_size: usize) -> QuillResult<SummaryPage>;

    /// Count drafts, optionally including tombstoned rows.
    async fn count(&self, include_tombstoned: bool) -> QuillResult<u64>;
}

/// Clamp pagination parameters the way the listing endpoints expect.
pub(crate) fn clamp_page(page: usize, page_size: usize) -> (usize, usize) {
    (page.max(1), page_size.clamp(1, MAX_PAGE_SIZE))
}
