//! Semantic-search index adapter.
//!
//! Mirrors change events into a search index over its HTTP API: creates and
//! updates become document upserts keyed by entity id, deletes remove the
//! document. The index assigns embeddings on its side; this adapter only
//! ships the document body.
//!
//! # Example
//!
//! ```rust,ignore
//! use synapse::adapters::SearchIndexAdapter;
//! use std::time::Duration;
//!
//! let adapter = SearchIndexAdapter::new("search", "http://index:8108/collections/entities")
//!     .with_api_key("sk_dev_key")
//!     .with_timeout(Duration::from_secs(5));
//! ```

use super::{TargetAdapter, TargetError};
use crate::event::{ChangeEvent, Operation};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for index requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP header carrying the index API key
const API_KEY_HEADER: &str = "X-Index-Api-Key";

/// An adapter that keeps a search index in step with the source of record.
#[derive(Debug, Clone)]
pub struct SearchIndexAdapter {
    /// Target name used in results and metrics
    name: String,

    /// Base URL of the index collection
    base_url: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    /// Request timeout
    timeout: Duration,

    /// Optional API key sent with every request
    api_key: Option<String>,
}

impl SearchIndexAdapter {
    /// Create a new adapter for the index collection at `base_url`.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
            api_key: None,
        }
    }

    /// Set the API key sent with every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set a custom request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Document URL for one entity.
    fn document_url(&self, event: &ChangeEvent) -> String {
        format!(
            "{}/documents/{}",
            self.base_url.trim_end_matches('/'),
            event.entity_id
        )
    }

    /// Build the upsert body for a create/update.
    fn build_document(&self, event: &ChangeEvent) -> serde_json::Value {
        json!({
            "id": event.entity_id,
            "entityType": event.entity_type,
            "sourceSequence": event.source_sequence,
            "updatedAt": event.occurred_at.to_rfc3339(),
            "body": event.payload,
        })
    }

    /// Map an HTTP response to the adapter error taxonomy.
    fn classify_status(&self, status: StatusCode, event: &ChangeEvent) -> Result<(), TargetError> {
        if status.is_success() {
            return Ok(());
        }

        // A delete for a document that never made it to the index is a no-op
        // under idempotent semantics, not a failure.
        if status == StatusCode::NOT_FOUND && event.operation == Operation::Delete {
            debug!(
                target = %self.name,
                entity_id = %event.entity_id,
                "Delete for absent document, treating as applied"
            );
            return Ok(());
        }

        if status.is_client_error() {
            warn!(
                target = %self.name,
                status = %status,
                entity_id = %event.entity_id,
                "Index rejected document"
            );
            return Err(TargetError::Validation(format!(
                "index returned {} for entity '{}'",
                status, event.entity_id
            )));
        }

        Err(TargetError::Transient(format!(
            "index returned {}",
            status
        )))
    }
}

#[async_trait]
impl TargetAdapter for SearchIndexAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<(), TargetError> {
        let url = self.document_url(event);

        debug!(
            target = %self.name,
            url = %url,
            operation = event.operation.as_str(),
            entity_id = %event.entity_id,
            "Applying change to search index"
        );

        let request = match event.operation {
            Operation::Create | Operation::Update => {
                // PUT keyed by entity id: replaying the same event rewrites
                // the same document, which is what idempotence requires.
                self.client
                    .put(&url)
                    .json(&self.build_document(event))
            }
            Operation::Delete => self.client.delete(&url),
        };

        let request = match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        };

        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TargetError::Transient(format!("index request timed out: {}", e))
                } else {
                    TargetError::Transient(format!("index request failed: {}", e))
                }
            })?;

        self.classify_status(response.status(), event)
    }
}
