//! Dead Letter Queue for terminally-failed events.
//!
//! When a (event, target) delivery exhausts its retry budget, is rejected as
//! invalid, or gives up waiting on an open breaker, the event lands here for
//! inspection and replay. Nothing is ever silently dropped: every event
//! reaches either APPLIED or an entry in this queue for every target.
//!
//! Storage sits behind [`DlqStore`], with a Redis implementation for
//! production and an in-memory one for tests and demos. Replay is driven by
//! the engine (the entry is re-submitted through the full pipeline and only
//! removed on success); this module owns durability and bookkeeping.
//!
//! # Example
//!
//! ```rust,ignore
//! use synapse::dlq::{DeadLetterQueue, DeadLetterReason, RedisDlqStore};
//!
//! let dlq = DeadLetterQueue::new(Arc::new(RedisDlqStore::new(redis_pool)));
//! dlq.enqueue(&event, "search", DeadLetterReason::RetryExhausted, attempts).await?;
//! let entries = dlq.list(&DlqFilter::default()).await?;
//! ```

use crate::event::{AttemptRecord, ChangeEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Redis key for the DLQ ordering index
const DLQ_INDEX_KEY: &str = "synapse:dlq:index";

/// Redis key prefix for individual DLQ entries
const DLQ_ENTRY_PREFIX: &str = "synapse:dlq:entry";

/// Maximum entries kept (oldest are trimmed past this)
const DLQ_MAX_LEN: usize = 10000;

/// Why an event was dead-lettered for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    /// Transient failures consumed the whole retry budget
    RetryExhausted,
    /// The target's breaker stayed open past the tolerated wait budget
    CircuitOpenTimeout,
    /// The target rejected the event as malformed; retrying cannot help
    ValidationRejected,
    /// Parked behind an earlier unresolved entry for the same entity/target
    OrderHeld,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::RetryExhausted => "retry_exhausted",
            DeadLetterReason::CircuitOpenTimeout => "circuit_open_timeout",
            DeadLetterReason::ValidationRejected => "validation_rejected",
            DeadLetterReason::OrderHeld => "order_held",
        }
    }
}

/// One dead-lettered (event, target) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    /// Queue-assigned entry id
    pub id: String,

    /// The original change event, intact for replay
    pub event: ChangeEvent,

    /// Target the delivery failed against
    pub target: String,

    /// Why it landed here
    pub reason: DeadLetterReason,

    /// Every attempt made so far, including replay attempts
    pub attempt_history: Vec<AttemptRecord>,

    /// When the entry was enqueued
    pub enqueued_at: DateTime<Utc>,
}

/// Filter for [`DeadLetterQueue::list`].
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub target: Option<String>,
    pub entity_id: Option<String>,
    pub reason: Option<DeadLetterReason>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl DlqFilter {
    fn matches(&self, entry: &DeadLetterEntry) -> bool {
        if let Some(target) = &self.target {
            if &entry.target != target {
                return false;
            }
        }
        if let Some(entity_id) = &self.entity_id {
            if &entry.event.entity_id != entity_id {
                return false;
            }
        }
        if let Some(reason) = self.reason {
            if entry.reason != reason {
                return false;
            }
        }
        true
    }
}

/// Errors from DLQ storage.
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("DLQ connection error: {0}")]
    Connection(String),

    #[error("DLQ command error: {0}")]
    Command(String),

    #[error("DLQ serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("DLQ entry not found: {0}")]
    NotFound(String),
}

/// Durable storage behind the queue.
///
/// `append` must be safe for concurrent use: delivery lanes enqueue from
/// concurrent tasks.
#[async_trait]
pub trait DlqStore: Send + Sync {
    /// Persist an entry, returning its assigned id.
    async fn append(&self, entry: DeadLetterEntry) -> Result<String, DlqError>;

    /// All entries in enqueue order.
    async fn scan(&self) -> Result<Vec<DeadLetterEntry>, DlqError>;

    /// One entry by id.
    async fn get(&self, id: &str) -> Result<Option<DeadLetterEntry>, DlqError>;

    /// Overwrite an existing entry in place (replay bookkeeping).
    async fn update(&self, entry: &DeadLetterEntry) -> Result<(), DlqError>;

    /// Remove an entry; returns whether it existed.
    async fn remove(&self, id: &str) -> Result<bool, DlqError>;
}

/// The dead-letter queue: bookkeeping and policy over a [`DlqStore`].
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn DlqStore>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn DlqStore>) -> Self {
        Self { store }
    }

    /// Enqueue a terminally-failed (event, target) pair.
    pub async fn enqueue(
        &self,
        event: &ChangeEvent,
        target: &str,
        reason: DeadLetterReason,
        attempt_history: Vec<AttemptRecord>,
    ) -> Result<String, DlqError> {
        let entry = DeadLetterEntry {
            id: String::new(), // assigned by the store
            event: event.clone(),
            target: target.to_string(),
            reason,
            attempt_history,
            enqueued_at: Utc::now(),
        };

        let id = self.store.append(entry).await?;

        info!(
            dlq_id = %id,
            event_id = event.event_id,
            entity_id = %event.entity_id,
            target = %target,
            reason = reason.as_str(),
            "Event dead-lettered"
        );

        Ok(id)
    }

    /// List entries matching `filter`, in enqueue order.
    pub async fn list(&self, filter: &DlqFilter) -> Result<Vec<DeadLetterEntry>, DlqError> {
        let entries = self.store.scan().await?;
        let filtered: Vec<DeadLetterEntry> = entries
            .into_iter()
            .filter(|e| filter.matches(e))
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();

        debug!(count = filtered.len(), "Listed DLQ entries");
        Ok(filtered)
    }

    /// Fetch one entry by id.
    pub async fn entry(&self, id: &str) -> Result<Option<DeadLetterEntry>, DlqError> {
        self.store.get(id).await
    }

    /// Number of entries currently queued.
    pub async fn count(&self) -> Result<usize, DlqError> {
        Ok(self.store.scan().await?.len())
    }

    /// Remove an entry after a successful replay.
    pub async fn resolve(&self, id: &str) -> Result<bool, DlqError> {
        let removed = self.store.remove(id).await?;
        if removed {
            info!(dlq_id = %id, "DLQ entry resolved");
        } else {
            debug!(dlq_id = %id, "DLQ entry already gone");
        }
        Ok(removed)
    }

    /// Explicitly discard an entry without replaying it.
    pub async fn purge(&self, id: &str) -> Result<bool, DlqError> {
        let removed = self.store.remove(id).await?;
        if removed {
            warn!(dlq_id = %id, "DLQ entry purged without replay");
        }
        Ok(removed)
    }

    /// Record a failed replay: extend the attempt history in place, never
    /// duplicating the entry.
    pub async fn record_replay_failure(
        &self,
        id: &str,
        attempts: Vec<AttemptRecord>,
    ) -> Result<(), DlqError> {
        let mut entry = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| DlqError::NotFound(id.to_string()))?;
        entry.attempt_history.extend(attempts);
        self.store.update(&entry).await
    }

    /// (target, entity_id) pairs that currently have an unresolved entry.
    ///
    /// The orchestrator seeds its ordering gate from this at startup, so later
    /// events for a blocked entity queue behind the gap instead of skipping it.
    pub async fn blocked_pairs(&self) -> Result<HashSet<(String, String)>, DlqError> {
        let entries = self.store.scan().await?;
        Ok(entries
            .into_iter()
            .map(|e| (e.target, e.event.entity_id))
            .collect())
    }
}

/// Redis-backed store: JSON entries indexed by a sorted set.
///
/// Entries live under their own keys so a failed replay can update the
/// attempt history in place; the index preserves enqueue order and bounds
/// total size.
#[derive(Clone)]
pub struct RedisDlqStore {
    pool: Pool,
    /// Monotonic suffix breaking score ties within one process
    seq: Arc<AtomicU64>,
}

impl RedisDlqStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    fn entry_key(id: &str) -> String {
        format!("{}:{}", DLQ_ENTRY_PREFIX, id)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, DlqError> {
        self.pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))
    }
}

#[async_trait]
impl DlqStore for RedisDlqStore {
    async fn append(&self, mut entry: DeadLetterEntry) -> Result<String, DlqError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}", entry.enqueued_at.timestamp_millis(), seq);
        entry.id = id.clone();

        let body = serde_json::to_string(&entry)?;
        let score = entry.enqueued_at.timestamp_millis();

        let mut conn = self.conn().await?;

        let _: () = cmd("SET")
            .arg(Self::entry_key(&id))
            .arg(&body)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        let _: () = cmd("ZADD")
            .arg(DLQ_INDEX_KEY)
            .arg(score)
            .arg(&id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        // Bound growth: trim the oldest entries past the cap.
        let len: usize = cmd("ZCARD")
            .arg(DLQ_INDEX_KEY)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        if len > DLQ_MAX_LEN {
            let overflow = len - DLQ_MAX_LEN;
            let oldest: Vec<String> = cmd("ZRANGE")
                .arg(DLQ_INDEX_KEY)
                .arg(0)
                .arg(overflow as isize - 1)
                .query_async(&mut conn)
                .await
                .map_err(|e| DlqError::Command(e.to_string()))?;

            for old_id in &oldest {
                let _: () = cmd("DEL")
                    .arg(Self::entry_key(old_id))
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| DlqError::Command(e.to_string()))?;
                let _: () = cmd("ZREM")
                    .arg(DLQ_INDEX_KEY)
                    .arg(old_id)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| DlqError::Command(e.to_string()))?;
            }
            warn!(trimmed = oldest.len(), "DLQ over capacity, trimmed oldest entries");
        }

        Ok(id)
    }

    async fn scan(&self) -> Result<Vec<DeadLetterEntry>, DlqError> {
        let mut conn = self.conn().await?;

        let ids: Vec<String> = cmd("ZRANGE")
            .arg(DLQ_INDEX_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let body: Option<String> = cmd("GET")
                .arg(Self::entry_key(&id))
                .query_async(&mut conn)
                .await
                .map_err(|e| DlqError::Command(e.to_string()))?;

            match body {
                Some(body) => entries.push(serde_json::from_str(&body)?),
                // Index and entries can drift if a DEL raced us; skip.
                None => debug!(dlq_id = %id, "DLQ index points at missing entry"),
            }
        }
        Ok(entries)
    }

    async fn get(&self, id: &str) -> Result<Option<DeadLetterEntry>, DlqError> {
        let mut conn = self.conn().await?;
        let body: Option<String> = cmd("GET")
            .arg(Self::entry_key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, entry: &DeadLetterEntry) -> Result<(), DlqError> {
        let body = serde_json::to_string(entry)?;
        let mut conn = self.conn().await?;
        let _: () = cmd("SET")
            .arg(Self::entry_key(&entry.id))
            .arg(&body)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, DlqError> {
        let mut conn = self.conn().await?;
        let removed: u64 = cmd("DEL")
            .arg(Self::entry_key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;
        let _: () = cmd("ZREM")
            .arg(DLQ_INDEX_KEY)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;
        Ok(removed > 0)
    }
}

/// In-memory store for tests and demos.
#[derive(Default)]
pub struct MemoryDlqStore {
    entries: Mutex<Vec<DeadLetterEntry>>,
    seq: AtomicU64,
}

impl MemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DlqStore for MemoryDlqStore {
    async fn append(&self, mut entry: DeadLetterEntry) -> Result<String, DlqError> {
        let id = format!("mem-{}", self.seq.fetch_add(1, Ordering::Relaxed));
        entry.id = id.clone();
        self.entries.lock().unwrap().push(entry);
        Ok(id)
    }

    async fn scan(&self) -> Result<Vec<DeadLetterEntry>, DlqError> {
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn get(&self, id: &str) -> Result<Option<DeadLetterEntry>, DlqError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn update(&self, entry: &DeadLetterEntry) -> Result<(), DlqError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(())
            }
            None => Err(DlqError::NotFound(entry.id.clone())),
        }
    }

    async fn remove(&self, id: &str) -> Result<bool, DlqError> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() < before)
    }
}
