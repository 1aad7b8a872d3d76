//! Target adapters for Synapse.
//!
//! A [`TargetAdapter`] translates a [`ChangeEvent`] into a native write
//! against one derived store. Adapters are the engine's only I/O boundary on
//! the delivery side; everything above them (retry, breaker, ordering,
//! checkpointing) treats them as an opaque `apply` call.
//!
//! ## Built-in adapters
//!
//! - [`SearchIndexAdapter`]: upserts/deletes documents in a semantic-search
//!   index over HTTP
//! - [`CacheAdapter`]: writes/invalidates derived keys in a Redis cache
//! - [`LogAdapter`]: logs the would-be write (dry runs, debugging)
//!
//! ## Idempotence
//!
//! Delivery is at-least-once: a crash between apply and checkpoint redelivers
//! the event. Every adapter must therefore apply idempotently — re-applying an
//! already-applied event yields the same target state.
//!
//! ## Writing a custom adapter
//!
//! ```rust,ignore
//! use synapse::adapters::{TargetAdapter, TargetError};
//! use synapse::event::ChangeEvent;
//! use async_trait::async_trait;
//!
//! struct MyStore;
//!
//! #[async_trait]
//! impl TargetAdapter for MyStore {
//!     fn name(&self) -> &str {
//!         "my-store"
//!     }
//!
//!     async fn apply(&self, event: &ChangeEvent) -> Result<(), TargetError> {
//!         // Upsert or delete, keyed by event.entity_id
//!         Ok(())
//!     }
//! }
//! ```

pub mod cache;
pub mod log;
pub mod search;

use crate::event::ChangeEvent;
use async_trait::async_trait;
use thiserror::Error;

pub use cache::CacheAdapter;
pub use log::LogAdapter;
pub use search::SearchIndexAdapter;

/// How an adapter failure should be handled upstream.
///
/// The two classes drive completely different policies: transient failures
/// consume retry budget and feed the circuit breaker; validation failures can
/// never succeed on retry and go straight to the dead-letter queue.
#[derive(Debug, Error)]
pub enum TargetError {
    /// Timeout, connection refused, 5xx — worth retrying
    #[error("transient target error: {0}")]
    Transient(String),

    /// The event is malformed or unsupported for this target — never retried
    #[error("validation rejected: {0}")]
    Validation(String),
}

impl TargetError {
    /// Whether retrying this failure can possibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TargetError::Transient(_))
    }
}

/// One derived store's write interface.
///
/// Adapters must be `Send + Sync`: the orchestrator invokes them from
/// concurrent per-entity delivery lanes.
#[async_trait]
pub trait TargetAdapter: Send + Sync {
    /// Unique target name (e.g. "search", "cache"), used in results,
    /// metrics and DLQ entries.
    fn name(&self) -> &str;

    /// Apply one change to the derived store.
    ///
    /// Must be idempotent. Per-entity ordering is guaranteed by the caller:
    /// for a given `entity_id` this adapter sees events in `source_sequence`
    /// order.
    async fn apply(&self, event: &ChangeEvent) -> Result<(), TargetError>;
}
