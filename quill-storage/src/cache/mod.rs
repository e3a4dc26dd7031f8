//! Shared cache layer with write-behind dirty tracking.
//!
//! This module provides the cross-process cache that sits in front of the
//! durable [`crate::store::VersionedStore`]:
//!
//! - [`CacheBackend`] is the backend boundary: TTL'd payload entries plus
//!   dirty markers, with the guarantee that an entry and its marker are
//!   written in one atomic transaction: a payload is never visible
//!   without its dirty state, and vice versa.
//! - [`MemoryCacheBackend`] keeps everything behind one lock, for tests
//!   and single-process deployments.
//! - [`LmdbCacheBackend`] is the production backend: a memory-mapped LMDB
//!   environment shared by every process on the host.
//! - [`CacheTier`] stitches a backend and the store together: read-through
//!   population, write-through/write-behind saves, dirty resolution, and
//!   transparent degradation to store-only behavior when the backend is
//!   unreachable.

pub mod lmdb;
pub mod memory;
pub mod tier;
pub mod traits;

pub use lmdb::{LmdbCacheBackend, LmdbCacheError};
pub use memory::MemoryCacheBackend;
pub use tier::{CacheTier, FlushOutcome, TierStats};
pub use traits::{CacheBackend, CacheBackendStats, CacheEntry};
