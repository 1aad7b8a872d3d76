//! The Synapse engine: polling, fan-out, ordering, and replay.
//!
//! [`SynapseEngine`] owns the whole pipeline. It polls the outbox in commit
//! order, fans each batch out to every configured target under a global
//! concurrency window, and checkpoints only once every (event, target) pair
//! in the batch reached a terminal outcome. Per-entity ordering is enforced
//! by lane construction: events sharing a (target, entity) pair run on one
//! lane in `source_sequence` order, while distinct entities run in parallel.
//!
//! When a delivery dead-letters, the (target, entity) pair is blocked: later
//! events for that pair are parked in the DLQ as ORDER_HELD instead of being
//! applied over the gap. The block survives restarts because it is re-derived
//! from unresolved DLQ entries at startup, and it lifts once replay drains
//! the pair's entries.

use crate::adapters::TargetAdapter;
use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::dlq::{DeadLetterQueue, DeadLetterReason, DlqError, DlqFilter};
use crate::event::{ChangeEvent, SyncResult};
use crate::lag::CdcLagTracker;
use crate::metrics::SynapseMetrics;
use crate::outbox::{Outbox, OutboxError};
use crate::processor::SynapseProcessor;
use crate::retry::{DeliveryFailure, RetryConfig, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SynapseState {
    /// Constructed, not yet running
    Dormant,
    /// Polling and delivering
    Running,
    /// Stop requested, draining in-flight work
    Stopping,
    /// Fully stopped; resume point is the last durable checkpoint
    Stopped,
}

impl SynapseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynapseState::Dormant => "dormant",
            SynapseState::Running => "running",
            SynapseState::Stopping => "stopping",
            SynapseState::Stopped => "stopped",
        }
    }
}

/// Engine loop tuning.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Events polled per batch
    pub batch_size: usize,

    /// Concurrent deliveries across all targets and entities
    pub concurrency_window: usize,

    /// Sleep between polls when the outbox is empty
    pub poll_interval: Duration,

    /// Sleep before re-polling after a poll failure
    pub poll_retry_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency_window: 16,
            poll_interval: Duration::from_millis(500),
            poll_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Fatal engine failures.
///
/// Poll failures are absorbed inside the loop; what escapes here stops the
/// engine: a checkpoint that cannot be persisted, or a DLQ that cannot accept
/// an entry (checkpointing past either would silently drop events).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Dlq(#[from] DlqError),

    #[error("delivery task failed: {0}")]
    Task(String),
}

/// Failures of a DLQ replay request.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("DLQ entry not found: {0}")]
    NotFound(String),

    #[error("no configured target named '{0}'")]
    UnknownTarget(String),

    /// An earlier unresolved entry for the same (target, entity) pair must
    /// be replayed first.
    #[error("entry {blocked} must wait for earlier entry {blocking} on the same entity")]
    OutOfOrder { blocked: String, blocking: String },

    /// The replay ran and failed again; the attempt history was extended.
    #[error("replay failed ({}): {last_error}", reason.as_str())]
    Failed {
        reason: DeadLetterReason,
        last_error: String,
    },

    #[error(transparent)]
    Dlq(#[from] DlqError),
}

/// One configured sync target: adapter plus its delivery policies.
pub struct SyncTarget {
    pub name: String,
    pub adapter: Arc<dyn TargetAdapter>,
    pub breaker: CircuitBreaker,
    pub retry: RetryPolicy,
    pub processor: SynapseProcessor,
}

/// Blocked (target, entity) pairs.
///
/// A pair blocks when one of its events dead-letters and unblocks when replay
/// drains its DLQ entries; while blocked, later events park as ORDER_HELD.
#[derive(Clone, Default)]
struct OrderingGate {
    blocked: Arc<Mutex<HashSet<(String, String)>>>,
}

impl OrderingGate {
    fn seed(&self, pairs: HashSet<(String, String)>) {
        *self.blocked.lock().expect("gate lock poisoned") = pairs;
    }

    fn is_blocked(&self, target: &str, entity_id: &str) -> bool {
        self.blocked
            .lock()
            .expect("gate lock poisoned")
            .contains(&(target.to_string(), entity_id.to_string()))
    }

    fn block(&self, target: &str, entity_id: &str) {
        self.blocked
            .lock()
            .expect("gate lock poisoned")
            .insert((target.to_string(), entity_id.to_string()));
    }

    fn unblock(&self, target: &str, entity_id: &str) {
        self.blocked
            .lock()
            .expect("gate lock poisoned")
            .remove(&(target.to_string(), entity_id.to_string()));
    }
}

/// The orchestrating engine.
pub struct SynapseEngine {
    outbox: Arc<dyn Outbox>,
    targets: Vec<Arc<SyncTarget>>,
    dlq: DeadLetterQueue,
    lag: Arc<CdcLagTracker>,
    metrics: Arc<SynapseMetrics>,
    options: EngineOptions,
    gate: OrderingGate,
    state: Mutex<SynapseState>,
    shutdown: ShutdownSignal,
}

impl SynapseEngine {
    pub fn new(
        outbox: Arc<dyn Outbox>,
        dlq: DeadLetterQueue,
        options: EngineOptions,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            outbox,
            targets: Vec::new(),
            dlq,
            lag: Arc::new(CdcLagTracker::new()),
            metrics: Arc::new(SynapseMetrics::new()),
            options,
            gate: OrderingGate::default(),
            state: Mutex::new(SynapseState::Dormant),
            shutdown,
        }
    }

    /// Use a custom lag tracker (threshold tuning).
    pub fn with_lag_tracker(mut self, lag: CdcLagTracker) -> Self {
        self.lag = Arc::new(lag);
        self
    }

    /// Register a target; its name is the adapter's name.
    ///
    /// The breaker's transitions feed the engine metrics.
    pub fn add_target(
        &mut self,
        adapter: Arc<dyn TargetAdapter>,
        breaker: BreakerConfig,
        retry: RetryConfig,
        per_attempt_timeout: Duration,
    ) {
        let name = adapter.name().to_string();
        self.metrics.register_target(&name);

        let metrics = self.metrics.clone();
        let hook_name = name.clone();
        let breaker =
            CircuitBreaker::new(&name, breaker).with_transition_hook(move |_, to| match to {
                CircuitState::Open => metrics.record_breaker_opened(&hook_name),
                CircuitState::Closed => metrics.record_breaker_closed(&hook_name),
                CircuitState::HalfOpen => {}
            });

        self.targets.push(Arc::new(SyncTarget {
            name,
            adapter,
            breaker,
            retry: RetryPolicy::new(retry),
            processor: SynapseProcessor::new(per_attempt_timeout),
        }));
    }

    pub fn state(&self) -> SynapseState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, to: SynapseState) {
        *self.state.lock().expect("state lock poisoned") = to;
    }

    pub fn metrics(&self) -> Arc<SynapseMetrics> {
        self.metrics.clone()
    }

    pub fn lag(&self) -> Arc<CdcLagTracker> {
        self.lag.clone()
    }

    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    /// Current breaker state per target, for the admin surface.
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.targets
            .iter()
            .map(|t| (t.name.clone(), t.breaker.state()))
            .collect()
    }

    /// Run the engine until a shutdown is requested or a fatal error occurs.
    ///
    /// Resumes from the last durable checkpoint; on shutdown, in-flight work
    /// gets the drain grace before being cancelled, and the checkpoint only
    /// advances past fully drained batches.
    pub async fn run(&self) -> Result<(), EngineError> {
        self.set_state(SynapseState::Running);
        let result = self.drive().await;
        self.set_state(SynapseState::Stopped);
        info!("Engine stopped");
        result
    }

    async fn drive(&self) -> Result<(), EngineError> {
        let mut shutdown_rx = self.shutdown.subscribe();

        // Startup reads hit the same stores as polling; a brief outage here
        // is retried like any poll failure, not treated as fatal.
        let blocked = loop {
            match self.dlq.blocked_pairs().await {
                Ok(blocked) => break blocked,
                Err(e @ (DlqError::Connection(_) | DlqError::Command(_))) => {
                    warn!(error = %e, "DLQ unreachable at startup, will retry");
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_retry_delay) => {}
                        _ = shutdown_rx.recv() => return Ok(()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };
        if !blocked.is_empty() {
            info!(pairs = blocked.len(), "Blocking entities with unresolved DLQ entries");
        }
        self.gate.seed(blocked);

        let mut checkpoint = loop {
            match self.outbox.last_checkpoint().await {
                Ok(checkpoint) => break checkpoint,
                Err(e @ OutboxError::Poll(_)) => {
                    warn!(error = %e, "Checkpoint read failed at startup, will retry");
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_retry_delay) => {}
                        _ = shutdown_rx.recv() => return Ok(()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };
        info!(
            checkpoint,
            targets = self.targets.len(),
            batch_size = self.options.batch_size,
            concurrency = self.options.concurrency_window,
            "Engine started"
        );

        loop {
            match shutdown_rx.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => break,
            }

            let events = match self.outbox.poll(checkpoint, self.options.batch_size).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "Outbox poll failed, will retry");
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_retry_delay) => continue,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            };

            if events.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.poll_interval) => continue,
                    _ = shutdown_rx.recv() => break,
                }
            }

            let high_water = events
                .iter()
                .map(|e| e.event_id)
                .max()
                .expect("batch is non-empty");

            let batch = self.process_batch(events);
            tokio::pin!(batch);

            let drained = tokio::select! {
                res = &mut batch => {
                    res?;
                    true
                }
                _ = shutdown_rx.recv() => {
                    self.set_state(SynapseState::Stopping);
                    let grace = self.shutdown.drain_grace();
                    info!(grace_ms = grace.as_millis() as u64, "Stop requested, draining in-flight batch");
                    match tokio::time::timeout(grace, &mut batch).await {
                        Ok(res) => {
                            res?;
                            true
                        }
                        Err(_) => {
                            warn!("Drain grace expired, cancelling in-flight deliveries");
                            false
                        }
                    }
                }
            };

            if drained {
                // The batch is fully terminal on every target; advancing the
                // checkpoint past it can no longer lose an event.
                self.outbox.checkpoint(high_water).await?;
                self.metrics.record_checkpoint(high_water);
                checkpoint = high_water;
            }

            if self.state() == SynapseState::Stopping {
                break;
            }
        }

        Ok(())
    }

    /// Drive one polled batch to a terminal outcome on every target.
    ///
    /// Lanes are (target, entity) pairs ordered by `source_sequence`; the
    /// semaphore bounds concurrent deliveries across all lanes. An error here
    /// means an entry could not be dead-lettered and the batch must not be
    /// checkpointed.
    pub async fn process_batch(&self, events: Vec<ChangeEvent>) -> Result<(), EngineError> {
        let count = events.len() as u64;
        debug!(events = count, "Processing batch");

        let mut lanes: HashMap<(usize, String), Vec<ChangeEvent>> = HashMap::new();
        for (idx, _) in self.targets.iter().enumerate() {
            for event in &events {
                lanes
                    .entry((idx, event.entity_id.clone()))
                    .or_default()
                    .push(event.clone());
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency_window));
        let mut set: JoinSet<Result<(), DlqError>> = JoinSet::new();

        for ((idx, _), mut lane) in lanes {
            lane.sort_by_key(|e| e.source_sequence);
            let target = self.targets[idx].clone();
            let dlq = self.dlq.clone();
            let lag = self.lag.clone();
            let metrics = self.metrics.clone();
            let gate = self.gate.clone();
            let semaphore = semaphore.clone();
            set.spawn(deliver_lane(
                target, lane, dlq, lag, metrics, gate, semaphore,
            ));
        }

        while let Some(joined) = set.join_next().await {
            joined.map_err(|e| EngineError::Task(e.to_string()))??;
        }

        self.metrics.record_batch(count);
        Ok(())
    }

    /// Re-submit a dead-lettered event through the full delivery pipeline.
    ///
    /// Replays must respect per-entity ordering: an entry is refused while an
    /// earlier unresolved entry exists for the same (target, entity) pair.
    /// Success removes the entry and, once the pair's entries are drained,
    /// lifts its ordering block; failure extends the attempt history in place.
    pub async fn replay(&self, entry_id: &str) -> Result<SyncResult, ReplayError> {
        let entry = self
            .dlq
            .entry(entry_id)
            .await?
            .ok_or_else(|| ReplayError::NotFound(entry_id.to_string()))?;

        let pair_filter = DlqFilter {
            target: Some(entry.target.clone()),
            entity_id: Some(entry.event.entity_id.clone()),
            ..Default::default()
        };

        let peers = self.dlq.list(&pair_filter).await?;
        if let Some(earlier) = peers
            .iter()
            .find(|p| p.id != entry.id && p.event.source_sequence < entry.event.source_sequence)
        {
            return Err(ReplayError::OutOfOrder {
                blocked: entry.id.clone(),
                blocking: earlier.id.clone(),
            });
        }

        let target = self
            .targets
            .iter()
            .find(|t| t.name == entry.target)
            .ok_or_else(|| ReplayError::UnknownTarget(entry.target.clone()))?;

        info!(
            dlq_id = %entry.id,
            event_id = entry.event.event_id,
            entity_id = %entry.event.entity_id,
            target = %entry.target,
            "Replaying DLQ entry"
        );

        match target
            .retry
            .deliver(
                &entry.event,
                target.adapter.as_ref(),
                &target.breaker,
                &target.processor,
            )
            .await
        {
            Ok(result) => {
                self.dlq.resolve(&entry.id).await?;
                self.metrics.record_applied(&target.name);
                self.lag.record(&target.name, &entry.event, Utc::now());

                let remaining = self.dlq.list(&pair_filter).await?;
                if remaining.is_empty() {
                    self.gate.unblock(&entry.target, &entry.event.entity_id);
                    info!(
                        target = %entry.target,
                        entity_id = %entry.event.entity_id,
                        "Entity unblocked, deliveries resume"
                    );
                }

                Ok(result)
            }
            Err(DeliveryFailure {
                reason,
                attempts,
                last_error,
                ..
            }) => {
                self.dlq.record_replay_failure(&entry.id, attempts).await?;
                Err(ReplayError::Failed { reason, last_error })
            }
        }
    }
}

/// Deliver one (target, entity) lane in sequence order.
async fn deliver_lane(
    target: Arc<SyncTarget>,
    lane: Vec<ChangeEvent>,
    dlq: DeadLetterQueue,
    lag: Arc<CdcLagTracker>,
    metrics: Arc<SynapseMetrics>,
    gate: OrderingGate,
    semaphore: Arc<Semaphore>,
) -> Result<(), DlqError> {
    for event in lane {
        if gate.is_blocked(&target.name, &event.entity_id) {
            // Applying over the gap would reorder the entity's history;
            // park behind it instead.
            dlq.enqueue(&event, &target.name, DeadLetterReason::OrderHeld, Vec::new())
                .await?;
            metrics.record_dead_lettered(&target.name);
            continue;
        }

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");
        let outcome = target
            .retry
            .deliver(
                &event,
                target.adapter.as_ref(),
                &target.breaker,
                &target.processor,
            )
            .await;
        drop(permit);

        match outcome {
            Ok(result) => {
                metrics.record_applied(&target.name);
                let retries = u64::from(result.attempt_count.saturating_sub(1));
                metrics.record_retries(&target.name, retries);
                metrics.record_failed_attempts(&target.name, retries);
                lag.record(&target.name, &event, Utc::now());
            }
            Err(failure) => {
                metrics.record_retries(
                    &target.name,
                    u64::from(failure.attempt_count.saturating_sub(1)),
                );
                metrics.record_failed_attempts(&target.name, failure.attempts.len() as u64);
                dlq.enqueue(&event, &target.name, failure.reason, failure.attempts)
                    .await?;
                metrics.record_dead_lettered(&target.name);
                gate.block(&target.name, &event.entity_id);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::TargetError;
    use crate::dlq::MemoryDlqStore;
    use crate::event::{Operation, SyncOutcome};
    use crate::outbox::MemoryOutbox;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet as StdHashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scriptable adapter: per-event transient failures, validation rejects,
    /// permanent failures; records successful applies in order.
    #[derive(Default)]
    struct TestAdapter {
        transient_before_success: Mutex<HashMap<u64, u32>>,
        reject: Mutex<StdHashSet<u64>>,
        always_fail: Mutex<StdHashSet<u64>>,
        applied: Mutex<Vec<u64>>,
        /// Keyed store state: entity_id -> last applied event id
        state: Mutex<HashMap<String, u64>>,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
    }

    impl TestAdapter {
        fn fail_transiently(&self, event_id: u64, times: u32) {
            self.transient_before_success
                .lock()
                .unwrap()
                .insert(event_id, times);
        }

        fn reject(&self, event_id: u64) {
            self.reject.lock().unwrap().insert(event_id);
        }

        fn always_fail(&self, event_id: u64) {
            self.always_fail.lock().unwrap().insert(event_id);
        }

        fn applied(&self) -> Vec<u64> {
            self.applied.lock().unwrap().clone()
        }

        fn state(&self) -> HashMap<String, u64> {
            self.state.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TargetAdapter for TestAdapter {
        fn name(&self) -> &str {
            "test"
        }

        async fn apply(&self, event: &ChangeEvent) -> Result<(), TargetError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.reject.lock().unwrap().contains(&event.event_id) {
                return Err(TargetError::Validation("malformed payload".into()));
            }
            if self.always_fail.lock().unwrap().contains(&event.event_id) {
                return Err(TargetError::Transient("connection refused".into()));
            }
            if let Some(n) = self
                .transient_before_success
                .lock()
                .unwrap()
                .get_mut(&event.event_id)
            {
                if *n > 0 {
                    *n -= 1;
                    return Err(TargetError::Transient("timeout".into()));
                }
            }
            self.applied.lock().unwrap().push(event.event_id);
            // Upsert/delete keyed by entity, like the real adapters.
            match event.operation {
                Operation::Create | Operation::Update => {
                    self.state
                        .lock()
                        .unwrap()
                        .insert(event.entity_id.clone(), event.event_id);
                }
                Operation::Delete => {
                    self.state.lock().unwrap().remove(&event.entity_id);
                }
            }
            Ok(())
        }
    }

    fn event(id: u64, entity: &str, op: Operation) -> ChangeEvent {
        ChangeEvent::new(id, "order", entity, op, json!({"n": id}))
    }

    fn engine_with(
        outbox: Arc<MemoryOutbox>,
        adapter: Arc<TestAdapter>,
        breaker: BreakerConfig,
        retry: RetryConfig,
    ) -> SynapseEngine {
        let dlq = DeadLetterQueue::new(Arc::new(MemoryDlqStore::new()));
        let options = EngineOptions {
            poll_interval: Duration::from_millis(10),
            poll_retry_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let mut engine = SynapseEngine::new(
            outbox,
            dlq,
            options,
            ShutdownSignal::with_drain_grace(Duration::from_secs(5)),
        );
        engine.add_target(adapter, breaker, retry, Duration::from_secs(1));
        engine
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(100),
            open_wait_limit: 2,
        }
    }

    fn closed_breaker() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 100,
            ..BreakerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_entity_applies_in_sequence_order() {
        let adapter = Arc::new(TestAdapter::default());
        let engine = engine_with(
            Arc::new(MemoryOutbox::new()),
            adapter.clone(),
            closed_breaker(),
            fast_retry(),
        );

        // Same entity with sequences out of event-id order.
        let events = vec![
            event(1, "order-1", Operation::Create).with_sequence(3),
            event(2, "order-1", Operation::Update).with_sequence(1),
            event(3, "order-1", Operation::Update).with_sequence(2),
        ];

        engine.process_batch(events).await.unwrap();

        assert_eq!(adapter.applied(), vec![2, 3, 1], "sequence order, not event order");
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_batch_converges_on_same_state() {
        let adapter = Arc::new(TestAdapter::default());
        let engine = engine_with(
            Arc::new(MemoryOutbox::new()),
            adapter.clone(),
            closed_breaker(),
            fast_retry(),
        );

        let events = vec![
            event(1, "order-1", Operation::Create),
            event(2, "order-1", Operation::Update),
            event(3, "order-2", Operation::Create),
            event(4, "order-2", Operation::Delete),
        ];

        engine.process_batch(events.clone()).await.unwrap();
        let state_after_first = adapter.state();
        assert_eq!(state_after_first.get("order-1"), Some(&2));
        assert!(!state_after_first.contains_key("order-2"));

        // A crash between batch resolution and checkpoint redelivers the
        // whole batch; re-applying must land on the same target state.
        engine.process_batch(events).await.unwrap();

        assert_eq!(adapter.state(), state_after_first);
        assert_eq!(engine.dlq().count().await.unwrap(), 0);
        assert_eq!(adapter.applied().len(), 8, "every redelivery is applied");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_window_bounds_in_flight_deliveries() {
        let adapter = Arc::new(TestAdapter::default());
        let outbox = Arc::new(MemoryOutbox::new());
        let dlq = DeadLetterQueue::new(Arc::new(MemoryDlqStore::new()));
        let mut engine = SynapseEngine::new(
            outbox,
            dlq,
            EngineOptions {
                concurrency_window: 2,
                ..Default::default()
            },
            ShutdownSignal::new(),
        );
        engine.add_target(
            adapter.clone(),
            closed_breaker(),
            fast_retry(),
            Duration::from_secs(1),
        );

        // Six distinct entities would all run in parallel without the window.
        let events = (1..=6)
            .map(|i| event(i, &format!("order-{}", i), Operation::Create))
            .collect();
        engine.process_batch(events).await.unwrap();

        assert_eq!(adapter.applied().len(), 6);
        assert!(adapter.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_recover_in_order() {
        let adapter = Arc::new(TestAdapter::default());
        // The UPDATE times out twice, then succeeds.
        adapter.fail_transiently(2, 2);
        let engine = engine_with(
            Arc::new(MemoryOutbox::new()),
            adapter.clone(),
            closed_breaker(),
            fast_retry(),
        );

        let events = vec![
            event(1, "order-1", Operation::Create),
            event(2, "order-1", Operation::Update),
        ];
        engine.process_batch(events).await.unwrap();

        assert_eq!(adapter.applied(), vec![1, 2]);
        assert_eq!(engine.dlq().count().await.unwrap(), 0);
        assert_eq!(engine.breaker_states()[0].1, CircuitState::Closed);

        let snap = engine.metrics().snapshot();
        let t = &snap.targets[0];
        assert_eq!(t.applied, 2);
        assert_eq!(t.retried, 2);

        let lag = engine.lag().snapshot();
        assert_eq!(lag.len(), 1);
        assert_eq!(lag[0].target, "test");
        assert_eq!(lag[0].samples, 2, "one lag sample per applied event");
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_dead_letters_and_holds_successors() {
        let adapter = Arc::new(TestAdapter::default());
        adapter.reject(1);
        let engine = engine_with(
            Arc::new(MemoryOutbox::new()),
            adapter.clone(),
            closed_breaker(),
            fast_retry(),
        );

        let events = vec![
            event(1, "order-1", Operation::Create),
            event(2, "order-1", Operation::Update),
        ];
        engine.process_batch(events).await.unwrap();

        assert!(adapter.applied().is_empty(), "nothing applies over the gap");

        let entries = engine.dlq().list(&DlqFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].reason, DeadLetterReason::ValidationRejected);
        assert_eq!(entries[0].attempt_history.len(), 1, "no retries on validation");
        assert_eq!(entries[1].reason, DeadLetterReason::OrderHeld);
        assert!(entries[1].attempt_history.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failures_open_breaker() {
        let adapter = Arc::new(TestAdapter::default());
        for id in 1..=3 {
            adapter.always_fail(id);
        }
        let engine = engine_with(
            Arc::new(MemoryOutbox::new()),
            adapter.clone(),
            BreakerConfig {
                failure_threshold: 3,
                rolling_window: Duration::from_secs(60),
                cooldown: Duration::from_secs(30),
                half_open_trials: 1,
            },
            RetryConfig {
                max_attempts: 1,
                ..fast_retry()
            },
        );

        // Distinct entities so every delivery reaches the adapter.
        let events = (1..=3)
            .map(|i| event(i, &format!("order-{}", i), Operation::Update))
            .collect();
        engine.process_batch(events).await.unwrap();

        assert_eq!(engine.breaker_states()[0].1, CircuitState::Open);
        let entries = engine.dlq().list(&DlqFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries
            .iter()
            .all(|e| e.reason == DeadLetterReason::RetryExhausted));

        let snap = engine.metrics().snapshot();
        assert_eq!(snap.targets[0].breaker_opened, 1);
        assert_eq!(snap.targets[0].dead_lettered, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_checkpoints_and_stops() {
        let adapter = Arc::new(TestAdapter::default());
        let outbox = Arc::new(MemoryOutbox::new());
        for id in 1..=3 {
            outbox.push(event(id, &format!("order-{}", id), Operation::Create));
        }

        let engine = Arc::new(engine_with(
            outbox.clone(),
            adapter.clone(),
            closed_breaker(),
            fast_retry(),
        ));
        let shutdown = engine.shutdown.clone();

        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        tokio::time::timeout(Duration::from_secs(60), async {
            while outbox.checkpoint_value() != 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("checkpoint should advance to the batch high-water mark");

        shutdown.trigger();
        runner.await.unwrap().unwrap();

        assert_eq!(engine.state(), SynapseState::Stopped);
        assert_eq!(adapter.applied().len(), 3);
        assert_eq!(engine.metrics().snapshot().checkpoint, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failures_are_retried_without_losing_progress() {
        let adapter = Arc::new(TestAdapter::default());
        let outbox = Arc::new(MemoryOutbox::new());
        outbox.push(event(1, "order-1", Operation::Create));
        outbox.push(event(2, "order-2", Operation::Create));
        outbox.fail_next_polls(2);

        let engine = Arc::new(engine_with(
            outbox.clone(),
            adapter.clone(),
            closed_breaker(),
            fast_retry(),
        ));
        let shutdown = engine.shutdown.clone();
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        tokio::time::timeout(Duration::from_secs(60), async {
            while outbox.checkpoint_value() != 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("poll failures must not stall the engine");

        shutdown.trigger();
        runner.await.unwrap().unwrap();
        assert_eq!(adapter.applied().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_checkpoint_read_failure_is_retried() {
        let adapter = Arc::new(TestAdapter::default());
        let outbox = Arc::new(MemoryOutbox::new());
        outbox.push(event(1, "order-1", Operation::Create));
        // Redis briefly unreachable while the engine boots.
        outbox.fail_next_checkpoint_reads(2);

        let engine = Arc::new(engine_with(
            outbox.clone(),
            adapter.clone(),
            closed_breaker(),
            fast_retry(),
        ));
        let shutdown = engine.shutdown.clone();
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        tokio::time::timeout(Duration::from_secs(60), async {
            while outbox.checkpoint_value() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("a transient startup read failure must not kill the engine");

        shutdown.trigger();
        runner.await.unwrap().unwrap();
        assert_eq!(adapter.applied(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_failure_stops_the_engine() {
        let adapter = Arc::new(TestAdapter::default());
        let outbox = Arc::new(MemoryOutbox::new());
        outbox.push(event(1, "order-1", Operation::Create));
        outbox.fail_next_checkpoints(1);

        let engine = Arc::new(engine_with(
            outbox.clone(),
            adapter,
            closed_breaker(),
            fast_retry(),
        ));
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        let result = runner.await.unwrap();
        assert!(matches!(
            result,
            Err(EngineError::Outbox(OutboxError::Checkpoint(_)))
        ));
        assert_eq!(engine.state(), SynapseState::Stopped);
        assert_eq!(outbox.checkpoint_value(), 0, "progress never advanced");
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_pairs_survive_restart() {
        let adapter = Arc::new(TestAdapter::default());
        let outbox = Arc::new(MemoryOutbox::new());
        let engine = Arc::new(engine_with(
            outbox.clone(),
            adapter.clone(),
            closed_breaker(),
            fast_retry(),
        ));

        // An unresolved entry from a previous run blocks the pair.
        engine
            .dlq()
            .enqueue(
                &event(5, "order-1", Operation::Create).with_sequence(5),
                "test",
                DeadLetterReason::RetryExhausted,
                vec![],
            )
            .await
            .unwrap();
        outbox.push(event(6, "order-1", Operation::Update).with_sequence(6));

        let shutdown = engine.shutdown.clone();
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        tokio::time::timeout(Duration::from_secs(60), async {
            while engine.dlq().count().await.unwrap() != 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("successor must park in the DLQ");

        shutdown.trigger();
        runner.await.unwrap().unwrap();

        assert!(adapter.applied().is_empty());
        let held = engine
            .dlq()
            .list(&DlqFilter {
                reason: Some(DeadLetterReason::OrderHeld),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].event.event_id, 6);
        // ORDER_HELD is terminal, so the checkpoint still advanced.
        assert_eq!(outbox.checkpoint_value(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_resolves_entry() {
        let adapter = Arc::new(TestAdapter::default());
        let engine = engine_with(
            Arc::new(MemoryOutbox::new()),
            adapter.clone(),
            closed_breaker(),
            fast_retry(),
        );

        let id = engine
            .dlq()
            .enqueue(
                &event(5, "order-1", Operation::Create),
                "test",
                DeadLetterReason::RetryExhausted,
                vec![],
            )
            .await
            .unwrap();

        let result = engine.replay(&id).await.unwrap();
        assert_eq!(result.outcome, SyncOutcome::Applied);
        assert_eq!(adapter.applied(), vec![5]);
        assert_eq!(engine.dlq().count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_refuses_out_of_order() {
        let adapter = Arc::new(TestAdapter::default());
        let engine = engine_with(
            Arc::new(MemoryOutbox::new()),
            adapter.clone(),
            closed_breaker(),
            fast_retry(),
        );

        let first = engine
            .dlq()
            .enqueue(
                &event(10, "order-1", Operation::Create).with_sequence(10),
                "test",
                DeadLetterReason::RetryExhausted,
                vec![],
            )
            .await
            .unwrap();
        let second = engine
            .dlq()
            .enqueue(
                &event(11, "order-1", Operation::Update).with_sequence(11),
                "test",
                DeadLetterReason::OrderHeld,
                vec![],
            )
            .await
            .unwrap();

        let err = engine.replay(&second).await.unwrap_err();
        assert!(matches!(err, ReplayError::OutOfOrder { .. }));
        assert!(adapter.applied().is_empty());

        // Draining in order works: first, then the held successor.
        engine.replay(&first).await.unwrap();
        engine.replay(&second).await.unwrap();
        assert_eq!(adapter.applied(), vec![10, 11]);
        assert_eq!(engine.dlq().count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_replay_extends_history_in_place() {
        let adapter = Arc::new(TestAdapter::default());
        adapter.always_fail(5);
        let engine = engine_with(
            Arc::new(MemoryOutbox::new()),
            adapter.clone(),
            closed_breaker(),
            RetryConfig {
                max_attempts: 2,
                ..fast_retry()
            },
        );

        let id = engine
            .dlq()
            .enqueue(
                &event(5, "order-1", Operation::Create),
                "test",
                DeadLetterReason::RetryExhausted,
                vec![crate::event::AttemptRecord::new(1, "timeout")],
            )
            .await
            .unwrap();

        let err = engine.replay(&id).await.unwrap_err();
        assert!(matches!(
            err,
            ReplayError::Failed {
                reason: DeadLetterReason::RetryExhausted,
                ..
            }
        ));

        assert_eq!(engine.dlq().count().await.unwrap(), 1, "never duplicated");
        let entry = engine.dlq().entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.attempt_history.len(), 3, "1 original + 2 replay attempts");
    }

    #[tokio::test]
    async fn test_replay_unknown_entry() {
        let engine = engine_with(
            Arc::new(MemoryOutbox::new()),
            Arc::new(TestAdapter::default()),
            closed_breaker(),
            fast_retry(),
        );
        assert!(matches!(
            engine.replay("nope").await,
            Err(ReplayError::NotFound(_))
        ));
    }
}
