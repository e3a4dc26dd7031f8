//! QUILL Core - Data Types, Errors, and Configuration
//!
//! Defines the shared vocabulary for the QUILL draft engine: the versioned
//! draft entity and its archived history, normalized draft keys, the error
//! taxonomy, and engine configuration. The storage and engine layers live
//! in `quill-storage` and `quill-engine`.

pub mod config;
pub mod draft;
pub mod error;
pub mod key;

pub use config::EngineConfig;
pub use draft::{CachedDraft, Draft, DraftSummary, HistoryEntry, SummaryPage};
pub use error::{
    CacheError, KeyError, QueueError, QuillError, QuillResult, StoreError, UpdateError,
};
pub use key::DraftKey;
