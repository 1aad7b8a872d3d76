//! Engine metrics.
//!
//! Per-target counters over every delivery outcome plus breaker transitions,
//! cheap enough to bump from hot delivery paths (atomic adds) and snapshotted
//! as JSON for the admin surface.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

/// Counters for one target.
#[derive(Default)]
pub struct TargetCounters {
    pub applied: AtomicU64,
    pub retried: AtomicU64,
    pub failed_attempts: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub breaker_opened: AtomicU64,
    pub breaker_closed: AtomicU64,
}

/// Point-in-time view of one target's counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetSnapshot {
    pub target: String,
    pub applied: u64,
    pub retried: u64,
    pub failed_attempts: u64,
    pub dead_lettered: u64,
    pub breaker_opened: u64,
    pub breaker_closed: u64,
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub batches_processed: u64,
    pub events_polled: u64,
    pub checkpoint: u64,
    pub targets: Vec<TargetSnapshot>,
}

/// Aggregated engine counters; shared via `Arc` across delivery tasks.
pub struct SynapseMetrics {
    started: Instant,
    batches_processed: AtomicU64,
    events_polled: AtomicU64,
    checkpoint: AtomicU64,
    targets: RwLock<HashMap<String, TargetCounters>>,
    // RwLock: target set is written once at startup, read on the hot path
    register_guard: Mutex<()>,
}

impl SynapseMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            batches_processed: AtomicU64::new(0),
            events_polled: AtomicU64::new(0),
            checkpoint: AtomicU64::new(0),
            targets: RwLock::new(HashMap::new()),
            register_guard: Mutex::new(()),
        }
    }

    /// Make a target known ahead of time so snapshots show zeroed counters.
    pub fn register_target(&self, target: &str) {
        let _guard = self.register_guard.lock().expect("metrics lock poisoned");
        self.targets
            .write()
            .expect("metrics lock poisoned")
            .entry(target.to_string())
            .or_default();
    }

    fn with_target<R>(&self, target: &str, f: impl Fn(&TargetCounters) -> R) -> R {
        {
            let targets = self.targets.read().expect("metrics lock poisoned");
            if let Some(counters) = targets.get(target) {
                return f(counters);
            }
        }
        self.register_target(target);
        let targets = self.targets.read().expect("metrics lock poisoned");
        f(targets.get(target).expect("target just registered"))
    }

    pub fn record_applied(&self, target: &str) {
        self.with_target(target, |c| c.applied.fetch_add(1, Ordering::Relaxed));
    }

    /// Count `retries` re-attempts (attempt_count - 1 of a resolved delivery).
    pub fn record_retries(&self, target: &str, retries: u64) {
        if retries > 0 {
            self.with_target(target, |c| c.retried.fetch_add(retries, Ordering::Relaxed));
        }
    }

    pub fn record_failed_attempts(&self, target: &str, failures: u64) {
        if failures > 0 {
            self.with_target(target, |c| {
                c.failed_attempts.fetch_add(failures, Ordering::Relaxed)
            });
        }
    }

    pub fn record_dead_lettered(&self, target: &str) {
        self.with_target(target, |c| c.dead_lettered.fetch_add(1, Ordering::Relaxed));
    }

    pub fn record_breaker_opened(&self, target: &str) {
        self.with_target(target, |c| c.breaker_opened.fetch_add(1, Ordering::Relaxed));
    }

    pub fn record_breaker_closed(&self, target: &str) {
        self.with_target(target, |c| c.breaker_closed.fetch_add(1, Ordering::Relaxed));
    }

    pub fn record_batch(&self, events: u64) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.events_polled.fetch_add(events, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self, event_id: u64) {
        self.checkpoint.store(event_id, Ordering::Relaxed);
    }

    /// Snapshot every counter for the admin surface.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let targets = self.targets.read().expect("metrics lock poisoned");
        let mut target_snapshots: Vec<TargetSnapshot> = targets
            .iter()
            .map(|(name, c)| TargetSnapshot {
                target: name.clone(),
                applied: c.applied.load(Ordering::Relaxed),
                retried: c.retried.load(Ordering::Relaxed),
                failed_attempts: c.failed_attempts.load(Ordering::Relaxed),
                dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
                breaker_opened: c.breaker_opened.load(Ordering::Relaxed),
                breaker_closed: c.breaker_closed.load(Ordering::Relaxed),
            })
            .collect();
        target_snapshots.sort_by(|a, b| a.target.cmp(&b.target));

        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs(),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            events_polled: self.events_polled.load(Ordering::Relaxed),
            checkpoint: self.checkpoint.load(Ordering::Relaxed),
            targets: target_snapshots,
        }
    }
}

impl Default for SynapseMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_per_target() {
        let metrics = SynapseMetrics::new();
        metrics.record_applied("search");
        metrics.record_applied("search");
        metrics.record_retries("search", 3);
        metrics.record_dead_lettered("cache");
        metrics.record_batch(10);
        metrics.record_checkpoint(42);

        let snap = metrics.snapshot();
        assert_eq!(snap.events_polled, 10);
        assert_eq!(snap.batches_processed, 1);
        assert_eq!(snap.checkpoint, 42);

        let search = snap.targets.iter().find(|t| t.target == "search").unwrap();
        assert_eq!(search.applied, 2);
        assert_eq!(search.retried, 3);
        assert_eq!(search.dead_lettered, 0);

        let cache = snap.targets.iter().find(|t| t.target == "cache").unwrap();
        assert_eq!(cache.dead_lettered, 1);
    }

    #[test]
    fn test_registered_target_shows_zeroed() {
        let metrics = SynapseMetrics::new();
        metrics.register_target("search");
        let snap = metrics.snapshot();
        assert_eq!(snap.targets.len(), 1);
        assert_eq!(snap.targets[0].applied, 0);
    }

    #[test]
    fn test_zero_retries_records_nothing() {
        let metrics = SynapseMetrics::new();
        metrics.record_retries("search", 0);
        let snap = metrics.snapshot();
        // Target is not even auto-registered for a no-op.
        assert!(snap.targets.is_empty());
    }
}
