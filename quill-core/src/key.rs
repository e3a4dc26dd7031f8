//! Normalized draft key type.
//!
//! The key insight is that `DraftKey`'s checked constructor makes an
//! unvalidated key UNCOMPILABLE. Every identifier that reaches the store,
//! the shared cache, or the mutation queue has already been trimmed and
//! checked for emptiness, so the layers below never re-validate.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::KeyError;

/// A normalized, non-empty draft identifier.
///
/// # Design
///
/// The private inner string ensures that a `DraftKey` can ONLY be
/// constructed via [`DraftKey::new`] (which normalizes and validates) or
/// [`DraftKey::generate`] (which produces a fresh unique key). External
/// identifiers arrive with stray whitespace or as empty strings; both are
/// rejected here, once, instead of in every layer below.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DraftKey(String);

impl DraftKey {
    /// Normalize and validate an externally supplied draft identifier.
    ///
    /// Leading and trailing whitespace is stripped. An empty result is
    /// rejected with [`KeyError::Empty`].
    pub fn new(raw: &str) -> Result<Self, KeyError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Generate a fresh, globally unique draft key.
    ///
    /// Format: `draft_<unix-seconds>_<uuid-prefix>`. The timestamp prefix
    /// keeps generated keys roughly sortable by creation time while the
    /// UUID suffix guarantees uniqueness across processes.
    pub fn generate() -> Self {
        let unix_secs = chrono::Utc::now().timestamp();
        let unique = Uuid::now_v7().simple().to_string();
        Self(format!("draft_{}_{}", unix_secs, &unique[..8]))
    }

    /// Borrow the normalized key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the key and return the underlying string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for DraftKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DraftKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for DraftKey {
    type Error = KeyError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trims_whitespace() {
        let key = DraftKey::new("  draft-1  ").expect("key should normalize");
        assert_eq!(key.as_str(), "draft-1");
    }

    #[test]
    fn test_new_rejects_empty() {
        assert!(matches!(DraftKey::new(""), Err(KeyError::Empty)));
        assert!(matches!(DraftKey::new("   "), Err(KeyError::Empty)));
        assert!(matches!(DraftKey::new("\t\n"), Err(KeyError::Empty)));
    }

    #[test]
    fn test_generate_is_unique() {
        let a = DraftKey::generate();
        let b = DraftKey::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("draft_"));
    }

    #[test]
    fn test_display_matches_as_str() {
        let key = DraftKey::new("draft-42").expect("valid key");
        assert_eq!(format!("{}", key), "draft-42");
    }

    #[test]
    fn test_serde_transparent() {
        let key = DraftKey::new("draft-7").expect("valid key");
        let json = serde_json::to_string(&key).expect("serialize");
        assert_eq!(json, "\"draft-7\"");
        let back: DraftKey = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, key);
    }

    use proptest::prelude::{prop_assert, prop_assert_eq};

    proptest::proptest! {
        /// Normalization is idempotent: a normalized key re-normalizes to
        /// itself, and never carries surrounding whitespace.
        #[test]
        fn prop_normalization_idempotent(raw in ".{0,64}") {
            if let Ok(key) = DraftKey::new(&raw) {
                prop_assert_eq!(key.as_str(), raw.trim());
                let again = DraftKey::new(key.as_str()).expect("normalized key is valid");
                prop_assert_eq!(again, key);
            } else {
                prop_assert!(raw.trim().is_empty());
            }
        }
    }
}
