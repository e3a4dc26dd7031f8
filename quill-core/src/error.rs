//! Error types for QUILL operations.
//!
//! Errors are grouped by subsystem and folded into a master [`QuillError`].
//! Version conflicts are ordinary control flow inside the update
//! coordinator and only surface to callers as
//! [`UpdateError::ConflictExhausted`]; every other kind propagates with its
//! kind preserved so callers can branch on it.

use std::time::Duration;

use thiserror::Error;

use crate::key::DraftKey;

/// Draft key validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Draft key is empty after normalization")]
    Empty,
}

/// Durable store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Draft not found: {key}")]
    NotFound { key: DraftKey },

    #[error("Version conflict for draft {key}: expected version {expected}")]
    VersionConflict { key: DraftKey, expected: i64 },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Corrupt row for draft {key}: {reason}")]
    Corrupt { key: DraftKey, reason: String },
}

/// Shared cache errors.
///
/// These are all degradable: the cache tier falls back to store-only
/// behavior rather than failing the operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Cache transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("Cache entry could not be decoded: {reason}")]
    Serialization { reason: String },
}

/// Mutation queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Operation for draft {key} timed out after {waited:?}")]
    Timeout { key: DraftKey, waited: Duration },

    #[error("Operation for draft {key} was cancelled by shutdown")]
    Cancelled { key: DraftKey },

    #[error("Mutation queue is shut down")]
    Shutdown,
}

/// Update coordinator errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Version conflicts exhausted {attempts} attempts for draft {key}")]
    ConflictExhausted { key: DraftKey, attempts: u32 },

    #[error("Mutation failed: {reason}")]
    Mutation { reason: String },
}

/// Master error type for all QUILL operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuillError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Update error: {0}")]
    Update(#[from] UpdateError),
}

impl QuillError {
    /// True for a store-level version conflict (the retried kind).
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, QuillError::Store(StoreError::VersionConflict { .. }))
    }

    /// True when the draft does not exist (or is tombstoned).
    pub fn is_not_found(&self) -> bool {
        matches!(self, QuillError::Store(StoreError::NotFound { .. }))
    }

    /// True for a shared-cache outage, the degradable kind.
    pub fn is_cache_unavailable(&self) -> bool {
        matches!(self, QuillError::Cache(CacheError::Unavailable { .. }))
    }

    /// True when retries were exhausted by version conflicts.
    pub fn is_conflict_exhausted(&self) -> bool {
        matches!(self, QuillError::Update(UpdateError::ConflictExhausted { .. }))
    }

    /// True for a per-operation queue timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, QuillError::Queue(QueueError::Timeout { .. }))
    }
}

/// Result type alias for QUILL operations.
pub type QuillResult<T> = Result<T, QuillError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DraftKey {
        DraftKey::new("draft-1").expect("valid key")
    }

    #[test]
    fn test_store_error_display_version_conflict() {
        let err = StoreError::VersionConflict {
            key: key(),
            expected: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Version conflict"));
        assert!(msg.contains("draft-1"));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_queue_error_display_timeout() {
        let err = QueueError::Timeout {
            key: key(),
            waited: Duration::from_secs(30),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("timed out"));
        assert!(msg.contains("draft-1"));
    }

    #[test]
    fn test_quill_error_from_variants() {
        let store = QuillError::from(StoreError::NotFound { key: key() });
        assert!(matches!(store, QuillError::Store(_)));

        let cache = QuillError::from(CacheError::Unavailable {
            reason: "connection refused".to_string(),
        });
        assert!(matches!(cache, QuillError::Cache(_)));

        let queue = QuillError::from(QueueError::Shutdown);
        assert!(matches!(queue, QuillError::Queue(_)));

        let update = QuillError::from(UpdateError::ConflictExhausted {
            key: key(),
            attempts: 3,
        });
        assert!(matches!(update, QuillError::Update(_)));
    }

    #[test]
    fn test_error_predicates() {
        let conflict = QuillError::from(StoreError::VersionConflict {
            key: key(),
            expected: 1,
        });
        assert!(conflict.is_version_conflict());
        assert!(!conflict.is_not_found());

        let not_found = QuillError::from(StoreError::NotFound { key: key() });
        assert!(not_found.is_not_found());
        assert!(!not_found.is_version_conflict());

        let degraded = QuillError::from(CacheError::Unavailable {
            reason: "down".to_string(),
        });
        assert!(degraded.is_cache_unavailable());

        let exhausted = QuillError::from(UpdateError::ConflictExhausted {
            key: key(),
            attempts: 3,
        });
        assert!(exhausted.is_conflict_exhausted());
        assert!(!exhausted.is_timeout());

        let timeout = QuillError::from(QueueError::Timeout {
            key: key(),
            waited: Duration::from_secs(1),
        });
        assert!(timeout.is_timeout());
        assert!(!timeout.is_conflict_exhausted());
    }
}
