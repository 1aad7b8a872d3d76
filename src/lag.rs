//! CDC lag tracking.
//!
//! Records the commit-to-apply delay of every successful application and
//! exposes rolling per-target percentiles plus a coarse health grade for
//! dashboards. Lag here is the end-to-end number operators actually care
//! about: how far each derived store trails the source of record.

use crate::event::ChangeEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Samples kept per target; older ones roll off
const WINDOW_SIZE: usize = 1024;

/// Default p95 threshold separating healthy from degraded
const DEFAULT_DEGRADED_P95: Duration = Duration::from_secs(30);

/// Coarse per-target health grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LagHealth {
    Healthy,
    Degraded,
}

/// Rolling lag percentiles for one target.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetLag {
    pub target: String,
    pub samples: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub health: LagHealth,
}

/// Tracks commit-to-apply delay distributions per target.
pub struct CdcLagTracker {
    degraded_p95: Duration,
    windows: Mutex<HashMap<String, VecDeque<Duration>>>,
}

impl CdcLagTracker {
    pub fn new() -> Self {
        Self::with_degraded_threshold(DEFAULT_DEGRADED_P95)
    }

    /// Use a custom p95 threshold for the Healthy/Degraded split.
    pub fn with_degraded_threshold(degraded_p95: Duration) -> Self {
        Self {
            degraded_p95,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a successful application of `event` to `target`.
    pub fn record(&self, target: &str, event: &ChangeEvent, applied_at: DateTime<Utc>) {
        let lag = (applied_at - event.occurred_at)
            .to_std()
            // Clock skew can put apply "before" commit; clamp to zero.
            .unwrap_or(Duration::ZERO);
        self.record_lag(target, lag);
    }

    /// Record a pre-computed lag duration.
    pub fn record_lag(&self, target: &str, lag: Duration) {
        let mut windows = self.windows.lock().expect("lag tracker lock poisoned");
        let window = windows.entry(target.to_string()).or_default();
        if window.len() == WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back(lag);
    }

    /// Rolling p50/p95/p99 and health for every tracked target.
    pub fn snapshot(&self) -> Vec<TargetLag> {
        let windows = self.windows.lock().expect("lag tracker lock poisoned");
        let mut out: Vec<TargetLag> = windows
            .iter()
            .map(|(target, window)| {
                let mut sorted: Vec<Duration> = window.iter().copied().collect();
                sorted.sort_unstable();

                let p50 = percentile(&sorted, 50.0);
                let p95 = percentile(&sorted, 95.0);
                let p99 = percentile(&sorted, 99.0);
                let health = if p95 > self.degraded_p95 {
                    LagHealth::Degraded
                } else {
                    LagHealth::Healthy
                };

                TargetLag {
                    target: target.clone(),
                    samples: sorted.len(),
                    p50_ms: p50.as_millis() as u64,
                    p95_ms: p95.as_millis() as u64,
                    p99_ms: p99.as_millis() as u64,
                    health,
                }
            })
            .collect();
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }

    /// Health grade for one target; `Healthy` when nothing is recorded yet.
    pub fn health(&self, target: &str) -> LagHealth {
        self.snapshot()
            .into_iter()
            .find(|t| t.target == target)
            .map(|t| t.health)
            .unwrap_or(LagHealth::Healthy)
    }
}

impl Default for CdcLagTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[Duration], pct: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
