//! Batch payload exchanged with producers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{BatchId, RequestId};

/// One batch of producer records, delivered as a single JSON document.
///
/// `records` are opaque to this crate; their schema belongs to the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub batch_id: BatchId,
    pub request_id: RequestId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_name: Option<String>,
    #[serde(default)]
    pub records: Vec<serde_json::Value>,
}

impl BatchPayload {
    pub fn new(batch_id: BatchId, records: Vec<serde_json::Value>) -> Self {
        Self {
            batch_id,
            request_id: RequestId::new(),
            timestamp: Utc::now(),
            source_file_name: None,
            records,
        }
    }

    pub fn with_source_file(mut self, name: impl Into<String>) -> Self {
        self.source_file_name = Some(name.into());
        self
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Serialize for storage in the durable queue.
    pub fn to_json(&self) -> Result<String, DomainError> {
        serde_json::to_string(self).map_err(|e| DomainError::payload(e.to_string()))
    }

    /// Rehydrate a stored payload.
    pub fn from_json(raw: &str) -> Result<Self, DomainError> {
        serde_json::from_str(raw).map_err(|e| DomainError::payload(e.to_string()))
    }
}
