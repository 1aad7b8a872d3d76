//! Log adapter - structured logging of would-be writes.
//!
//! Applies nothing; logs what a real target would have done. Useful as a dry
//! run target when bringing up a new pipeline, and as an audit trail.

use super::{TargetAdapter, TargetError};
use crate::event::ChangeEvent;
use async_trait::async_trait;
use tracing::info;

/// An adapter that only logs the changes it receives.
#[derive(Debug, Clone)]
pub struct LogAdapter {
    /// Target name used in results and metrics
    name: String,
}

impl LogAdapter {
    /// Create a log adapter with the given target name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogAdapter {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl TargetAdapter for LogAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<(), TargetError> {
        info!(
            target = %self.name,
            event_id = event.event_id,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            operation = event.operation.as_str(),
            sequence = event.source_sequence,
            "Change observed"
        );
        Ok(())
    }
}
