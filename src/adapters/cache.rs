//! Redis cache adapter.
//!
//! Keeps a read-through cache consistent with the source of record: creates
//! and updates overwrite the derived key, deletes remove it. Writes are plain
//! SET/DEL keyed by entity, so redelivery converges on the same state.

use super::{TargetAdapter, TargetError};
use crate::event::{ChangeEvent, Operation};
use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use tracing::debug;

/// Default key namespace for cached entities
const DEFAULT_KEY_PREFIX: &str = "synapse:cache";

/// An adapter that mirrors entities into a Redis cache.
#[derive(Clone)]
pub struct CacheAdapter {
    /// Target name used in results and metrics
    name: String,

    /// Redis connection pool
    pool: Pool,

    /// Key namespace, producing keys like `synapse:cache:order:order-42`
    key_prefix: String,

    /// Optional TTL for cached entries, in seconds
    ttl_seconds: Option<u64>,
}

impl CacheAdapter {
    /// Create a new cache adapter over the given pool.
    pub fn new(name: impl Into<String>, pool: Pool) -> Self {
        Self {
            name: name.into(),
            pool,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl_seconds: None,
        }
    }

    /// Set a custom key namespace.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Expire cached entries after `seconds`.
    pub fn with_ttl_seconds(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }

    /// Cache key for one entity.
    fn cache_key(&self, event: &ChangeEvent) -> String {
        format!("{}:{}:{}", self.key_prefix, event.entity_type, event.entity_id)
    }
}

#[async_trait]
impl TargetAdapter for CacheAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<(), TargetError> {
        let key = self.cache_key(event);

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TargetError::Transient(format!("cache connection error: {}", e)))?;

        match event.operation {
            Operation::Create | Operation::Update => {
                let body = serde_json::to_string(&event.payload).map_err(|e| {
                    // A payload that cannot be serialized will never cache;
                    // retrying is pointless.
                    TargetError::Validation(format!("unserializable payload: {}", e))
                })?;

                let mut set = cmd("SET");
                set.arg(&key).arg(&body);
                if let Some(ttl) = self.ttl_seconds {
                    set.arg("EX").arg(ttl);
                }
                let _: () = set
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| TargetError::Transient(format!("cache SET failed: {}", e)))?;

                debug!(
                    target = %self.name,
                    key = %key,
                    operation = event.operation.as_str(),
                    "Cache entry written"
                );
            }
            Operation::Delete => {
                // DEL of a missing key is 0, not an error: idempotent.
                let _: u64 = cmd("DEL")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| TargetError::Transient(format!("cache DEL failed: {}", e)))?;

                debug!(target = %self.name, key = %key, "Cache entry invalidated");
            }
        }

        Ok(())
    }
}
