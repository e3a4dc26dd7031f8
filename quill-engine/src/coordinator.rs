//! Optimistic update coordinator.
//!
//! Implements the retry-with-backoff protocol over the cache tier:
//!
//! 1. Fetch the current (payload, version) through the tier.
//! 2. Apply the caller's mutation to a clone of the payload.
//! 3. Attempt a conditional save fenced on the fetched version.
//! 4. On conflict, wait (doubling delay) and start over from step 1.
//!
//! Conflicts are contained here; the caller only ever sees
//! `UpdateError::ConflictExhausted` once the retry budget is spent. Every
//! other error kind propagates unchanged on first occurrence.

use std::sync::Arc;
use std::time::Duration;

use quill_core::{DraftKey, QuillResult, UpdateError};
use quill_storage::{CacheBackend, CacheTier};

/// A pure transformation of a draft payload.
///
/// The coordinator may invoke this once per attempt, each time against a
/// freshly fetched payload: a version conflict discards the produced
/// output entirely and the function runs again on the new read. It must
/// therefore be a pure function of its input with no external side
/// effects; that property is the caller's responsibility and is not
/// enforced here.
pub type DocumentFn = dyn Fn(&[u8]) -> QuillResult<Vec<u8>> + Send + Sync;

/// A shareable, type-erased [`DocumentFn`].
pub type Mutator = Arc<DocumentFn>;

/// Result of a successful coordinated update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// The version the draft ended up at.
    pub new_version: i64,
    /// How many attempts it took (1 = no conflicts).
    pub attempts: u32,
}

/// Retry-with-backoff coordinator over a [`CacheTier`].
pub struct UpdateCoordinator<C: CacheBackend> {
    tier: Arc<CacheTier<C>>,
    base_delay: Duration,
}

impl<C: CacheBackend> UpdateCoordinator<C> {
    pub fn new(tier: Arc<CacheTier<C>>, base_delay: Duration) -> Self {
        Self { tier, base_delay }
    }

    /// Apply `mutate` to the draft, retrying version conflicts up to
    /// `max_retries` attempts with exponential backoff.
    ///
    /// A missing draft surfaces `NotFound` immediately; store outages and
    /// mutation failures are likewise not retried.
    pub async fn apply(
        &self,
        key: &DraftKey,
        mutate: &DocumentFn,
        max_retries: u32,
    ) -> QuillResult<UpdateOutcome> {
        let max_retries = max_retries.max(1);
        let mut delay = self.base_delay;

        for attempt in 1..=max_retries {
            let (payload, version) = self.tier.get_with_version(key).await?;

            let new_payload = mutate(&payload)?;

            match self.tier.save(key, new_payload, Some(version), true).await {
                Ok(new_version) => {
                    tracing::debug!(
                        key = %key,
                        new_version,
                        attempt,
                        "draft updated"
                    );
                    return Ok(UpdateOutcome {
                        new_version,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_version_conflict() => {
                    if attempt < max_retries {
                        tracing::warn!(
                            key = %key,
                            attempt,
                            max_retries,
                            retry_in_ms = delay.as_millis() as u64,
                            "version conflict, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        tracing::error!(key = %key, max_retries, "update failed: version conflicts exhausted retries");
        Err(UpdateError::ConflictExhausted {
            key: key.clone(),
            attempts: max_retries,
        }
        .into())
    }
}
