//! Core change-event and result types for Synapse.
//!
//! A [`ChangeEvent`] is one committed mutation captured from the authoritative
//! store's outbox. Events are polled in commit order and fanned out to every
//! configured target; each (event, target) pair resolves to exactly one
//! terminal [`SyncResult`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// The kind of mutation a change event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Short lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// A committed change captured from the authoritative store.
///
/// # Ordering
///
/// Events sharing an `entity_id` must reach any given target in
/// `source_sequence` order. Events for distinct entities carry no relative
/// ordering requirement, which is where the engine's parallelism comes from.
///
/// # Example
///
/// ```json
/// {
///   "eventId": 42,
///   "occurredAt": "2026-08-24T10:00:00Z",
///   "entityType": "order",
///   "entityId": "order-42",
///   "operation": "UPDATE",
///   "payload": { "status": "shipped" },
///   "sourceSequence": 1042
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Unique id, monotonic within a source partition
    pub event_id: u64,

    /// Source commit time
    pub occurred_at: DateTime<Utc>,

    /// Kind of entity that changed (e.g. "order", "document")
    pub entity_type: String,

    /// Identity of the changed entity; the per-target ordering key
    pub entity_id: String,

    /// The mutation kind
    pub operation: Operation,

    /// Arbitrary JSON payload describing the change
    pub payload: Value,

    /// Ordering token assigned at commit time
    pub source_sequence: u64,
}

impl ChangeEvent {
    /// Create a new change event occurring now.
    pub fn new(
        event_id: u64,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Value,
    ) -> Self {
        Self {
            event_id,
            occurred_at: Utc::now(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            payload,
            // With a single source partition the event id doubles as the
            // ordering token unless the caller overrides it.
            source_sequence: event_id,
        }
    }

    /// Override the source ordering token.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.source_sequence = sequence;
        self
    }

    /// Override the commit timestamp.
    pub fn with_occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }
}

/// Outcome of one (event, target) delivery.
///
/// `Applied` and `DeadLettered` are terminal; `Retried` and `Failed` describe
/// intermediate attempts and only surface through metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncOutcome {
    Applied,
    Retried,
    Failed,
    DeadLettered,
}

impl SyncOutcome {
    /// Whether this outcome retires the (event, target) pair.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncOutcome::Applied | SyncOutcome::DeadLettered)
    }
}

/// The immutable record of one (event, target) delivery.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Event this result belongs to
    pub event_id: u64,

    /// Target name
    pub target: String,

    /// Delivery outcome
    pub outcome: SyncOutcome,

    /// Number of adapter attempts made (0 if the event never reached the adapter)
    pub attempt_count: u32,

    /// Wall-clock time from first attempt to resolution
    #[serde(with = "duration_millis")]
    pub latency: Duration,

    /// Last error observed, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    /// Build a successful result.
    pub fn applied(event_id: u64, target: &str, attempt_count: u32, latency: Duration) -> Self {
        Self {
            event_id,
            target: target.to_string(),
            outcome: SyncOutcome::Applied,
            attempt_count,
            latency,
            error: None,
        }
    }

    /// Build a failed (non-terminal) result carrying the classified error.
    pub fn failed(
        event_id: u64,
        target: &str,
        attempt_count: u32,
        latency: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            event_id,
            target: target.to_string(),
            outcome: SyncOutcome::Failed,
            attempt_count,
            latency,
            error: Some(error.into()),
        }
    }

    /// Build a terminal dead-lettered result.
    pub fn dead_lettered(
        event_id: u64,
        target: &str,
        attempt_count: u32,
        latency: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            event_id,
            target: target.to_string(),
            outcome: SyncOutcome::DeadLettered,
            attempt_count,
            latency,
            error: Some(error.into()),
        }
    }

    /// Whether this result retires the (event, target) pair.
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_terminal()
    }
}

/// One recorded delivery attempt, kept in DLQ attempt histories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,

    /// Error that failed the attempt
    pub error: String,

    /// When the attempt resolved
    pub at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(attempt: u32, error: impl Into<String>) -> Self {
        Self {
            attempt,
            error: error.into(),
            at: Utc::now(),
        }
    }
}

/// One observed commit-to-apply delay, fed to the lag tracker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LagSample {
    pub target: String,
    pub event_id: u64,
    #[serde(with = "duration_millis")]
    pub commit_to_apply: Duration,
}

/// Serialize a `Duration` as integer milliseconds.
pub(crate) mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
