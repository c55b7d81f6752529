// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync job data structures and buffer-store key conventions.
//!
//! A [`SyncJob`] is the unit of work that flows through the pipeline. Producers
//! push it (JSON-encoded) onto `sync:queue:<type>`; workers pop it, persist its
//! `data` to the durable store, and either finish it, schedule a retry, or wrap
//! it into a [`DeadLetterJob`].
//!
//! The wire shape is shared with producers written in other languages, so the
//! field names are fixed:
//!
//! ```json
//! {
//!   "id": "2f1c…",
//!   "type": "citizen",
//!   "key": "12345678901",
//!   "collection": "citizens",
//!   "data": {"cpf": "12345678901", "nome": "Test User"},
//!   "timestamp": "2026-01-05T10:00:00Z",
//!   "retry_count": 0,
//!   "max_retries": 3
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use sync_reconciler::SyncJob;
//! use serde_json::json;
//!
//! let job = SyncJob::new("citizen", "12345678901", "citizens", json!({"nome": "Test User"}));
//! assert_eq!(job.retry_count, 0);
//! assert_eq!(job.queue_key(), "sync:queue:citizen");
//! assert_eq!(job.write_key(), "citizen:write:12345678901");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::traits::Document;

/// Retry budget used when a producer omits `max_retries`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Queue list for a job type: `sync:queue:<type>`.
#[must_use]
pub fn queue_key(job_type: &str) -> String {
    format!("sync:queue:{}", job_type)
}

/// Dead-letter list for a job type: `sync:dlq:<type>`.
#[must_use]
pub fn dead_letter_key(job_type: &str) -> String {
    format!("sync:dlq:{}", job_type)
}

/// Delayed-retry sorted set for a job type: `sync:delayed:<type>`.
#[must_use]
pub fn delayed_key(job_type: &str) -> String {
    format!("sync:delayed:{}", job_type)
}

/// Write-buffer entry: `<type>:write:<key>`.
#[must_use]
pub fn write_key(job_type: &str, key: &str) -> String {
    format!("{}:write:{}", job_type, key)
}

/// Read-cache entry: `<type>:cache:<key>`.
#[must_use]
pub fn cache_key(job_type: &str, key: &str) -> String {
    format!("{}:cache:{}", job_type, key)
}

/// A pending write waiting to be persisted to the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    /// Opaque job identifier (UUID when created by [`SyncJob::new`])
    pub id: String,
    /// Job type; selects the queue and the cache/write-buffer namespace
    #[serde(rename = "type")]
    pub job_type: String,
    /// Natural key used to match the target document
    pub key: String,
    /// Target collection in the durable store
    pub collection: String,
    /// Fields to persist
    #[serde(default)]
    pub data: Value,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Failed attempts so far
    #[serde(default)]
    pub retry_count: u32,
    /// Failed attempts allowed before dead-lettering
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl SyncJob {
    /// Create a fresh job with a random id and the default retry budget.
    pub fn new(
        job_type: impl Into<String>,
        key: impl Into<String>,
        collection: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            key: key.into(),
            collection: collection.into(),
            data,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Override the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Parse a queue entry.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Encode for the queue.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Count one more failed attempt.
    ///
    /// Returns `true` when the retry budget is now spent.
    pub fn record_failure(&mut self) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        self.is_exhausted()
    }

    /// Whether the job may no longer be requeued.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// The payload as a document (string-keyed map).
    ///
    /// Fails for payloads that are not JSON objects; such jobs can never be
    /// persisted and will eventually be dead-lettered.
    pub fn document(&self) -> Result<Document, String> {
        match &self.data {
            Value::Object(map) => Ok(map.clone()),
            Value::Null => Err("job data is empty".to_string()),
            other => Err(format!("job data is not a document: {}", type_name(other))),
        }
    }

    /// Read a string field from the payload.
    #[must_use]
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    #[must_use]
    pub fn queue_key(&self) -> String {
        queue_key(&self.job_type)
    }

    #[must_use]
    pub fn dead_letter_key(&self) -> String {
        dead_letter_key(&self.job_type)
    }

    #[must_use]
    pub fn delayed_key(&self) -> String {
        delayed_key(&self.job_type)
    }

    #[must_use]
    pub fn write_key(&self) -> String {
        write_key(&self.job_type, &self.key)
    }

    #[must_use]
    pub fn cache_key(&self) -> String {
        cache_key(&self.job_type, &self.key)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A job that exhausted its retries. Terminal; only operators read these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterJob {
    /// The job exactly as it was when it failed for the last time
    pub original_job: SyncJob,
    /// Last error message (never empty)
    pub error: String,
    /// When the job was dead-lettered
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterJob {
    pub fn new(job: SyncJob, error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unknown error".to_string();
        }
        Self {
            original_job: job,
            error,
            failed_at: Utc::now(),
        }
    }

    /// Wrap a queue entry that could not be parsed at all.
    ///
    /// The raw text is kept in `data` so an operator can repair and
    /// resubmit it.
    pub fn malformed(queue: &str, raw: &str, error: impl Into<String>) -> Self {
        let placeholder = SyncJob {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: queue.to_string(),
            key: String::new(),
            collection: String::new(),
            data: Value::String(raw.to_string()),
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: 0,
        };
        Self::new(placeholder, format!("malformed job: {}", error.into()))
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
