//! The per-(event, target) apply step.
//!
//! [`SynapseProcessor`] makes exactly one adapter attempt: it runs the call
//! under the per-attempt timeout and classifies whatever comes back. It holds
//! no retry or breaker logic and never propagates an adapter failure — the
//! caller always gets a classified answer. Safe for unrestricted concurrent
//! use across distinct events and targets; per-entity ordering is the
//! orchestrator's job.

use crate::adapters::{TargetAdapter, TargetError};
use crate::event::{ChangeEvent, SyncResult};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::debug;

/// Default per-attempt timeout when a target does not configure one
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stateless apply step: adapter call + timeout + classification.
#[derive(Debug, Clone)]
pub struct SynapseProcessor {
    /// Budget for a single adapter call; an overrun is a transient failure
    per_attempt_timeout: Duration,
}

impl Default for SynapseProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPT_TIMEOUT)
    }
}

impl SynapseProcessor {
    pub fn new(per_attempt_timeout: Duration) -> Self {
        Self { per_attempt_timeout }
    }

    /// Make one adapter attempt under the per-attempt timeout.
    ///
    /// A timeout is returned as [`TargetError::Transient`]: a slow target is
    /// indistinguishable from an unavailable one and is retried as such.
    pub async fn attempt(
        &self,
        event: &ChangeEvent,
        adapter: &dyn TargetAdapter,
    ) -> Result<(), TargetError> {
        match timeout(self.per_attempt_timeout, adapter.apply(event)).await {
            Ok(result) => result,
            Err(_) => Err(TargetError::Transient(format!(
                "apply timed out after {}ms",
                self.per_attempt_timeout.as_millis()
            ))),
        }
    }

    /// Apply one event to one target, capturing any failure into the result.
    ///
    /// Never returns an error: an adapter failure becomes a FAILED
    /// [`SyncResult`] carrying the classified error message.
    pub async fn process(&self, event: &ChangeEvent, adapter: &dyn TargetAdapter) -> SyncResult {
        let started = Instant::now();

        match self.attempt(event, adapter).await {
            Ok(()) => {
                debug!(
                    target = adapter.name(),
                    event_id = event.event_id,
                    entity_id = %event.entity_id,
                    "Change applied"
                );
                SyncResult::applied(event.event_id, adapter.name(), 1, started.elapsed())
            }
            Err(e) => {
                debug!(
                    target = adapter.name(),
                    event_id = event.event_id,
                    error = %e,
                    "Apply attempt failed"
                );
                SyncResult::failed(
                    event.event_id,
                    adapter.name(),
                    1,
                    started.elapsed(),
                    e.to_string(),
                )
            }
        }
    }
}
