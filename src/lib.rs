//! # Synapse CDC Engine
//!
//! A change-data-capture synchronization engine keeping derived stores
//! (search index, cache, audit log) consistent with a single source of
//! record, with at-least-once delivery and per-entity ordering.
//!
//! ## Architecture
//!
//! ```text
//! Outbox -> Engine -> [Retry + Breaker] -> Target Adapters
//!                 \-> Dead Letter Queue -> Replay
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Change events and delivery results
//! - [`outbox`]: Outbox polling and durable checkpointing
//! - [`adapters`]: Target adapters (search index, cache, log)
//! - [`processor`]: Single-attempt apply step with timeout
//! - [`breaker`]: Per-target circuit breakers
//! - [`retry`]: Backoff policy driving deliveries to a decision
//! - [`dlq`]: Dead letter queue with replay bookkeeping
//! - [`lag`]: Commit-to-apply lag percentiles per target
//! - [`metrics`]: Engine counters for the admin surface
//! - [`synapse`]: The orchestrating engine
//! - [`config`]: TOML configuration with env substitution
//! - [`shutdown`]: Graceful drain-then-cancel shutdown

pub mod adapters;
pub mod breaker;
pub mod config;
pub mod dlq;
pub mod event;
pub mod lag;
pub mod metrics;
pub mod outbox;
pub mod processor;
pub mod retry;
pub mod shutdown;
pub mod synapse;

// Re-export commonly used types at crate root
pub use adapters::{TargetAdapter, TargetError};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use dlq::{DeadLetterEntry, DeadLetterQueue, DeadLetterReason};
pub use event::{ChangeEvent, Operation, SyncOutcome, SyncResult};
pub use outbox::Outbox;
pub use retry::{RetryConfig, RetryPolicy};
pub use synapse::{EngineOptions, SynapseEngine, SynapseState};
