//! QUILL Storage - Versioned Store, Cache Tier, and Reconciler
//!
//! Defines the storage abstraction layer for the QUILL draft engine:
//! the durable [`VersionedStore`] with conditional (compare-and-swap)
//! writes and append-only history, the shared [`CacheBackend`] with
//! TTL entries and atomically coupled dirty markers, the [`CacheTier`]
//! that stitches the two together, and the background [`reconciler`]
//! that flushes write-behind data into the store.

pub mod cache;
pub mod reconciler;
pub mod store;

pub use cache::{
    CacheBackend, CacheBackendStats, CacheEntry, CacheTier, FlushOutcome, LmdbCacheBackend,
    LmdbCacheError, MemoryCacheBackend, TierStats,
};
pub use reconciler::{
    reconcile_once, reconciler_task, ReconcilerConfig, ReconcilerMetrics, ReconcilerSnapshot,
};
pub use store::{MemoryStore, PgConfig, PostgresStore, VersionedStore};
