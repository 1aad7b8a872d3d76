//! Per-target circuit breaker.
//!
//! Every sync target owns one [`CircuitBreaker`]. The breaker counts failures
//! inside a rolling window; once `failure_threshold` is reached it opens and
//! fails fast for `cooldown`, bounding the worst-case latency a dead target
//! can impose on the pipeline. After the cooldown a single half-open probe is
//! allowed through: success closes the breaker, failure re-opens it and the
//! cooldown starts over.
//!
//! # Example
//!
//! ```rust,ignore
//! use synapse::breaker::{BreakerConfig, CircuitBreaker};
//!
//! let breaker = CircuitBreaker::new("search", BreakerConfig::default());
//! let result = breaker.guard(|| adapter.apply(&event)).await;
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The three breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow through; failures are counted
    Closed,
    /// Calls are rejected until the cooldown elapses
    Open,
    /// A limited number of probe calls are allowed through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Rejection returned while the breaker is open.
///
/// Carries the remaining cooldown so callers can wait it out instead of
/// burning retry budget against a breaker that cannot admit them.
#[derive(Debug, Clone, Error)]
#[error("circuit for '{target}' is open, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    pub target: String,
    pub retry_after: Duration,
}

/// Result of a guarded call: either the call's own error or a fast rejection.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without invoking it
    #[error(transparent)]
    Open(CircuitOpenError),

    /// The call was invoked and failed; the failure has been counted
    #[error(transparent)]
    Inner(E),
}

/// Per-target breaker tuning.
///
/// Different derived stores have different latency and availability profiles,
/// so every target carries its own config.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `rolling_window` that open the breaker
    pub failure_threshold: u32,

    /// Window over which failures are counted
    pub rolling_window: Duration,

    /// How long the breaker stays open before probing
    pub cooldown: Duration,

    /// Probe calls admitted while half-open
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            rolling_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_trials: 1,
        }
    }
}

struct Inner {
    state: CircuitState,
    /// Failure timestamps within the rolling window
    failures: VecDeque<Instant>,
    /// When the breaker last opened
    opened_at: Option<Instant>,
    /// Probes currently in flight while half-open
    probes_in_flight: u32,
}

/// A failure-aware gate in front of one target adapter.
///
/// State is mutated only under the breaker's own lock; the struct is safe to
/// share across delivery tasks behind an `Arc`.
pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    transition_hook: Option<Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>>,
}

impl CircuitBreaker {
    /// Create a closed breaker for the named target.
    pub fn new(target: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probes_in_flight: 0,
            }),
            transition_hook: None,
        }
    }

    /// Install a hook invoked on every state transition (used for metrics).
    pub fn with_transition_hook(
        mut self,
        hook: impl Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.transition_hook = Some(Box::new(hook));
        self
    }

    /// Name of the guarded target.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current state, transitioning Open -> HalfOpen if the cooldown elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh(&mut inner);
        inner.state
    }

    /// Run `call` under the breaker.
    ///
    /// While open the call is never invoked and `BreakerError::Open` is
    /// returned immediately. A call that runs has its success or failure
    /// recorded against the rolling window.
    pub async fn guard<F, Fut, T, E>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire().map_err(BreakerError::Open)?;

        match call().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Check whether a call may proceed right now.
    ///
    /// Admitting a call while half-open claims one probe slot; the caller must
    /// follow up with [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let retry_after = self.remaining_cooldown(&inner);
                Err(CircuitOpenError {
                    target: self.target.clone(),
                    retry_after,
                })
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_trials {
                    inner.probes_in_flight += 1;
                    debug!(target = %self.target, "Admitting half-open probe");
                    Ok(())
                } else {
                    // Probe slots taken: behave as open until the probe resolves.
                    Err(CircuitOpenError {
                        target: self.target.clone(),
                        retry_after: self.config.cooldown,
                    })
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.failures.clear();
                inner.opened_at = None;
                self.transition(&mut inner, CircuitState::Closed);
                info!(target = %self.target, "Probe succeeded, circuit closed");
            }
            CircuitState::Closed => {
                self.prune(&mut inner);
            }
            CircuitState::Open => {
                // A call admitted before the breaker opened may resolve late;
                // nothing to do.
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
                warn!(
                    target = %self.target,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "Probe failed, circuit re-opened"
                );
            }
            CircuitState::Closed => {
                inner.failures.push_back(Instant::now());
                self.prune(&mut inner);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(
                        target = %self.target,
                        failures = inner.failures.len(),
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "Failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Remaining cooldown before the next half-open probe is admitted.
    fn remaining_cooldown(&self, inner: &Inner) -> Duration {
        inner
            .opened_at
            .map(|at| self.config.cooldown.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    /// Drop failures that fell out of the rolling window.
    fn prune(&self, inner: &mut Inner) {
        // With a freshly started (or paused) clock the window may reach back
        // before the process epoch.
        let Some(cutoff) = Instant::now().checked_sub(self.config.rolling_window) else {
            return;
        };
        while let Some(front) = inner.failures.front() {
            if *front < cutoff {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Open -> HalfOpen once the cooldown has elapsed.
    fn refresh(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.cooldown {
                    inner.probes_in_flight = 0;
                    self.transition(inner, CircuitState::HalfOpen);
                    info!(target = %self.target, "Cooldown elapsed, circuit half-open");
                }
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        if let Some(hook) = &self.transition_hook {
            hook(from, to);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            rolling_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(10),
            half_open_trials: 1,
        }
    }

    #[tokio::test]
    async fn test_closed_until_threshold() {
        let breaker = CircuitBreaker::new("t", test_config());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("t", test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }

        let mut invoked = false;
        let result: Result<(), BreakerError<&str>> = breaker
            .guard(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open(_))));
        assert!(!invoked, "open breaker must never invoke the call");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown_then_close_on_success() {
        let breaker = CircuitBreaker::new("t", test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let result: Result<(), BreakerError<&str>> = breaker.guard(|| async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_and_resets_cooldown() {
        let breaker = CircuitBreaker::new("t", test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let result: Result<(), BreakerError<&str>> =
            breaker.guard(|| async { Err("still down") }).await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.state(), CircuitState::Open);

        // Cooldown restarted: still open half-way through.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_slot_while_half_open() {
        let breaker = CircuitBreaker::new("t", test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        // First probe claims the slot, second caller is rejected.
        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.try_acquire().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_expires_failures() {
        let breaker = CircuitBreaker::new("t", test_config());
        breaker.record_failure();
        breaker.record_failure();

        // Old failures age out of the window before the third lands.
        tokio::time::advance(Duration::from_secs(61)).await;
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rejection_carries_remaining_cooldown() {
        let breaker = CircuitBreaker::new("t", test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        let err = breaker.try_acquire().unwrap_err();
        assert_eq!(err.target, "t");
        assert!(err.retry_after <= Duration::from_secs(10));
        assert!(err.retry_after > Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_transition_hook_fires() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let opened = Arc::new(AtomicU32::new(0));
        let opened_clone = opened.clone();
        let breaker = CircuitBreaker::new("t", test_config()).with_transition_hook(
            move |_, to| {
                if to == CircuitState::Open {
                    opened_clone.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }
}
