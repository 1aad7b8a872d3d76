//! Outbox polling and checkpointing.
//!
//! The authoritative store writes every committed change into an outbox; the
//! engine polls it in commit order and durably checkpoints how far delivery
//! has progressed. The contract is deliberately small: `poll` returns events
//! strictly after a checkpoint, never skips, and may redeliver after a crash;
//! `checkpoint` is the engine's only durable progress marker.
//!
//! Two implementations: [`RedisOutbox`] (a Redis stream addressed by event
//! id, with the checkpoint in a plain key) and [`MemoryOutbox`] for tests
//! and demos.

use crate::event::ChangeEvent;
use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Default Redis stream holding outbox events
const OUTBOX_STREAM_KEY: &str = "synapse:outbox";

/// Default Redis key holding the durable checkpoint
const CHECKPOINT_KEY: &str = "synapse:outbox:checkpoint";

/// Outbox failures, split by how the engine must react.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The outbox store was unreachable; retried independently, never
    /// corrupts checkpointed progress
    #[error("outbox poll failed: {0}")]
    Poll(String),

    /// Progress could not be durably persisted; fatal to the engine loop
    #[error("checkpoint persistence failed: {0}")]
    Checkpoint(String),

    #[error("outbox serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The authoritative store's outbox, as consumed by the engine.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Events with `event_id > after`, in commit order, at most `limit`.
    async fn poll(&self, after: u64, limit: usize) -> Result<Vec<ChangeEvent>, OutboxError>;

    /// Durably record that every event up to `event_id` reached a terminal
    /// outcome on every target.
    async fn checkpoint(&self, event_id: u64) -> Result<(), OutboxError>;

    /// The last durable checkpoint (0 when none was ever written).
    async fn last_checkpoint(&self) -> Result<u64, OutboxError>;
}

/// Redis-stream-backed outbox.
///
/// Events are stored under explicit stream ids `{event_id}-0`, so
/// poll-after-checkpoint is an exclusive `XRANGE` scan and commit order is
/// the stream order.
#[derive(Clone)]
pub struct RedisOutbox {
    pool: Pool,
    stream_key: String,
    checkpoint_key: String,
}

impl RedisOutbox {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            stream_key: OUTBOX_STREAM_KEY.to_string(),
            checkpoint_key: CHECKPOINT_KEY.to_string(),
        }
    }

    /// Use custom keys (multiple pipelines against one Redis).
    pub fn with_keys(mut self, stream_key: impl Into<String>, checkpoint_key: impl Into<String>) -> Self {
        self.stream_key = stream_key.into();
        self.checkpoint_key = checkpoint_key.into();
        self
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, OutboxError> {
        self.pool
            .get()
            .await
            .map_err(|e| OutboxError::Poll(e.to_string()))
    }

    /// Append one event (producer side; used by demos and tests — the real
    /// producer is the authoritative store writing transactionally).
    pub async fn publish(&self, event: &ChangeEvent) -> Result<(), OutboxError> {
        let body = serde_json::to_string(event)?;
        let mut conn = self.conn().await?;
        let _: String = cmd("XADD")
            .arg(&self.stream_key)
            .arg(format!("{}-0", event.event_id))
            .arg("event")
            .arg(&body)
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Poll(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Outbox for RedisOutbox {
    async fn poll(&self, after: u64, limit: usize) -> Result<Vec<ChangeEvent>, OutboxError> {
        let mut conn = self.conn().await?;

        // Exclusive range start: everything strictly after the checkpoint.
        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(&self.stream_key)
            .arg(format!("({}-0", after))
            .arg("+")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Poll(e.to_string()))?;

        let mut events = Vec::with_capacity(entries.len());
        for (stream_id, fields) in entries {
            let body = fields
                .iter()
                .find(|(k, _)| k == "event")
                .map(|(_, v)| v.as_str())
                .ok_or_else(|| {
                    OutboxError::Poll(format!("outbox entry {} missing event field", stream_id))
                })?;
            events.push(serde_json::from_str(body)?);
        }

        debug!(after = after, count = events.len(), "Polled outbox");
        Ok(events)
    }

    async fn checkpoint(&self, event_id: u64) -> Result<(), OutboxError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| OutboxError::Checkpoint(e.to_string()))?;

        let _: () = cmd("SET")
            .arg(&self.checkpoint_key)
            .arg(event_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Checkpoint(e.to_string()))?;

        info!(checkpoint = event_id, "Checkpoint advanced");
        Ok(())
    }

    async fn last_checkpoint(&self) -> Result<u64, OutboxError> {
        let mut conn = self.conn().await?;
        let value: Option<u64> = cmd("GET")
            .arg(&self.checkpoint_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| OutboxError::Poll(e.to_string()))?;
        Ok(value.unwrap_or(0))
    }
}

/// In-process outbox for tests and demos, with failure injection.
#[derive(Default)]
pub struct MemoryOutbox {
    events: Mutex<Vec<ChangeEvent>>,
    checkpoint: AtomicU64,
    /// Next N polls fail with a poll error
    poll_failures: AtomicU32,
    /// Every checkpoint fails while nonzero
    checkpoint_failures: AtomicU32,
    /// Next N checkpoint reads fail with a poll error
    checkpoint_read_failures: AtomicU32,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append events (kept sorted by event id).
    pub fn push(&self, event: ChangeEvent) {
        let mut events = self.events.lock().unwrap();
        events.push(event);
        events.sort_by_key(|e| e.event_id);
    }

    /// Make the next `n` polls fail.
    pub fn fail_next_polls(&self, n: u32) {
        self.poll_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` checkpoints fail.
    pub fn fail_next_checkpoints(&self, n: u32) {
        self.checkpoint_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` checkpoint reads fail.
    pub fn fail_next_checkpoint_reads(&self, n: u32) {
        self.checkpoint_read_failures.store(n, Ordering::SeqCst);
    }

    pub fn checkpoint_value(&self) -> u64 {
        self.checkpoint.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Outbox for MemoryOutbox {
    async fn poll(&self, after: u64, limit: usize) -> Result<Vec<ChangeEvent>, OutboxError> {
        if self
            .poll_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OutboxError::Poll("injected poll failure".into()));
        }

        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_id > after)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn checkpoint(&self, event_id: u64) -> Result<(), OutboxError> {
        if self
            .checkpoint_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OutboxError::Checkpoint("injected checkpoint failure".into()));
        }
        self.checkpoint.store(event_id, Ordering::SeqCst);
        Ok(())
    }

    async fn last_checkpoint(&self) -> Result<u64, OutboxError> {
        if self
            .checkpoint_read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OutboxError::Poll("injected checkpoint read failure".into()));
        }
        Ok(self.checkpoint.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Operation;
    use serde_json::json;

    fn event(id: u64) -> ChangeEvent {
        ChangeEvent::new(id, "order", format!("order-{}", id), Operation::Create, json!({}))
    }

    #[tokio::test]
    async fn test_memory_outbox_polls_after_checkpoint() {
        let outbox = MemoryOutbox::new();
        for id in 1..=5 {
            outbox.push(event(id));
        }

        let all = outbox.poll(0, 10).await.unwrap();
        assert_eq!(all.len(), 5);

        outbox.checkpoint(3).await.unwrap();
        let after = outbox.poll(outbox.last_checkpoint().await.unwrap(), 10).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].event_id, 4);
    }

    #[tokio::test]
    async fn test_memory_outbox_limit_and_order() {
        let outbox = MemoryOutbox::new();
        // Pushed out of order; polled in commit order.
        outbox.push(event(3));
        outbox.push(event(1));
        outbox.push(event(2));

        let polled = outbox.poll(0, 2).await.unwrap();
        assert_eq!(polled.len(), 2);
        assert_eq!(polled[0].event_id, 1);
        assert_eq!(polled[1].event_id, 2);
    }

    #[tokio::test]
    async fn test_memory_outbox_redelivers_unacked() {
        let outbox = MemoryOutbox::new();
        outbox.push(event(1));

        // Polling twice without checkpointing redelivers: at-least-once.
        assert_eq!(outbox.poll(0, 10).await.unwrap().len(), 1);
        assert_eq!(outbox.poll(0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_read_failure_injection_recovers() {
        let outbox = MemoryOutbox::new();
        outbox.checkpoint(7).await.unwrap();
        outbox.fail_next_checkpoint_reads(1);

        assert!(matches!(
            outbox.last_checkpoint().await,
            Err(OutboxError::Poll(_))
        ));
        assert_eq!(outbox.last_checkpoint().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_poll_failure_injection_is_transient() {
        let outbox = MemoryOutbox::new();
        outbox.push(event(1));
        outbox.fail_next_polls(2);

        assert!(matches!(
            outbox.poll(0, 10).await,
            Err(OutboxError::Poll(_))
        ));
        assert!(outbox.poll(0, 10).await.is_err());
        assert!(outbox.poll(0, 10).await.is_ok());
    }
}
