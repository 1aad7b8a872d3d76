//! Retry policy: backoff, attempt budget, and breaker interplay.
//!
//! [`RetryPolicy::deliver`] drives one (event, target) pair to a decision:
//! applied, or terminally failed with a [`DeadLetterReason`]. Delays follow
//! `min(backoff_base * 2^attempt + jitter, backoff_cap)` and only transient
//! failures consume the attempt budget. Validation failures bypass retry
//! entirely — retrying a malformed event can never succeed. A breaker
//! rejection is a scheduling signal, not a failure: the policy waits out the
//! remaining cooldown without consuming an attempt, up to `open_wait_limit`
//! consecutive waits.

use crate::adapters::{TargetAdapter, TargetError};
use crate::breaker::CircuitBreaker;
use crate::dlq::DeadLetterReason;
use crate::event::{AttemptRecord, ChangeEvent, SyncResult};
use crate::processor::SynapseProcessor;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Floor for open-breaker waits, so a zero remaining cooldown cannot spin
const MIN_OPEN_WAIT: Duration = Duration::from_millis(10);

/// Per-target retry tuning.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Adapter attempts before giving up
    pub max_attempts: u32,

    /// First backoff delay; doubles every attempt
    pub backoff_base: Duration,

    /// Upper bound on any single delay
    pub backoff_cap: Duration,

    /// Consecutive open-breaker waits tolerated before dead-lettering
    pub open_wait_limit: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            open_wait_limit: 3,
        }
    }
}

/// Terminal failure of a delivery, carrying everything the DLQ needs.
#[derive(Debug, Error)]
#[error("delivery to '{target}' failed terminally: {last_error}")]
pub struct DeliveryFailure {
    pub target: String,
    pub reason: DeadLetterReason,
    pub attempts: Vec<AttemptRecord>,
    pub attempt_count: u32,
    pub latency: Duration,
    pub last_error: String,
}

/// Retry-with-backoff wrapped around a breaker-guarded apply step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before re-attempting after `attempt` failures (0-based).
    ///
    /// Exponential with full additive jitter, capped at `backoff_cap`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.config.backoff_base.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(16));
        let jitter_ms = rand::thread_rng().gen_range(0..=base_ms.max(1));
        let delay = Duration::from_millis(exp_ms.saturating_add(jitter_ms));
        delay.min(self.config.backoff_cap)
    }

    /// Drive one (event, target) pair to a decision.
    ///
    /// Returns the APPLIED result, or a [`DeliveryFailure`] the caller turns
    /// into a DLQ entry. The breaker is consulted before every attempt;
    /// validation answers do not feed its failure window (the target answered
    /// authoritatively, it is not unhealthy).
    pub async fn deliver(
        &self,
        event: &ChangeEvent,
        adapter: &dyn TargetAdapter,
        breaker: &CircuitBreaker,
        processor: &SynapseProcessor,
    ) -> Result<SyncResult, DeliveryFailure> {
        let started = Instant::now();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut attempt_count: u32 = 0;
        let mut open_waits: u32 = 0;

        loop {
            if let Err(open) = breaker.try_acquire() {
                if open_waits >= self.config.open_wait_limit {
                    warn!(
                        target = adapter.name(),
                        event_id = event.event_id,
                        waits = open_waits,
                        "Gave up waiting on open circuit"
                    );
                    return Err(DeliveryFailure {
                        target: adapter.name().to_string(),
                        reason: DeadLetterReason::CircuitOpenTimeout,
                        attempt_count,
                        latency: started.elapsed(),
                        last_error: open.to_string(),
                        attempts,
                    });
                }
                open_waits += 1;
                let wait = open.retry_after.max(MIN_OPEN_WAIT);
                debug!(
                    target = adapter.name(),
                    event_id = event.event_id,
                    wait_ms = wait.as_millis() as u64,
                    "Circuit open, waiting out cooldown"
                );
                // Not a consumed attempt: hammering an open breaker would
                // waste the retry budget without ever reaching the target.
                tokio::time::sleep(wait).await;
                continue;
            }

            attempt_count += 1;

            match processor.attempt(event, adapter).await {
                Ok(()) => {
                    breaker.record_success();
                    return Ok(SyncResult::applied(
                        event.event_id,
                        adapter.name(),
                        attempt_count,
                        started.elapsed(),
                    ));
                }
                Err(TargetError::Validation(msg)) => {
                    // The target answered; release the breaker slot as a
                    // success and dead-letter without retrying.
                    breaker.record_success();
                    attempts.push(AttemptRecord::new(attempt_count, &msg));
                    return Err(DeliveryFailure {
                        target: adapter.name().to_string(),
                        reason: DeadLetterReason::ValidationRejected,
                        attempt_count,
                        latency: started.elapsed(),
                        last_error: msg,
                        attempts,
                    });
                }
                Err(TargetError::Transient(msg)) => {
                    breaker.record_failure();
                    attempts.push(AttemptRecord::new(attempt_count, &msg));

                    if attempt_count >= self.config.max_attempts {
                        return Err(DeliveryFailure {
                            target: adapter.name().to_string(),
                            reason: DeadLetterReason::RetryExhausted,
                            attempt_count,
                            latency: started.elapsed(),
                            last_error: msg,
                            attempts,
                        });
                    }

                    open_waits = 0;
                    let delay = self.delay_for(attempt_count - 1);
                    debug!(
                        target = adapter.name(),
                        event_id = event.event_id,
                        attempt = attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
