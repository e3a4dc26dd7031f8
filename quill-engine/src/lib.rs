//! QUILL Engine - Coordinated Draft Mutation
//!
//! The consumer-facing layer of the QUILL draft engine. Wires the cache
//! tier and versioned store from `quill-storage` behind three pieces:
//!
//! - [`UpdateCoordinator`]: the optimistic retry-with-backoff update
//!   protocol (fetch, mutate a clone, conditional save, retry on
//!   conflict).
//! - [`MutationQueue`]: per-key FIFO serialization of mutations inside
//!   one process, so local callers stop racing each other into the
//!   coordinator. Provides no cross-process guarantee; version fencing
//!   at the store is what holds across processes.
//! - [`DraftEngine`]: the facade the surrounding application consumes:
//!   create/read/update/delete/list/stats plus deterministic shutdown of
//!   the background tasks.

pub mod coordinator;
pub mod engine;
pub mod queue;

pub use coordinator::{DocumentFn, Mutator, UpdateCoordinator, UpdateOutcome};
pub use engine::{DraftEngine, EngineStats};
pub use queue::{MutationQueue, QueueConfig, QueueStats};
