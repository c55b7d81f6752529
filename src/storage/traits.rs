// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Store-neutral document form: a string-keyed map of JSON values.
///
/// Backends convert this into their native representation (BSON for Mongo,
/// a JSON text column for SQL).
pub type Document = Map<String, Value>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    #[must_use]
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }
}

/// Memory figures reported by the buffer store (`INFO memory` for Redis).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    /// 0 when no limit is configured
    pub max_bytes: u64,
}

impl MemoryUsage {
    /// Fraction of the limit in use, `None` when unlimited.
    #[must_use]
    pub fn ratio(&self) -> Option<f64> {
        if self.max_bytes == 0 {
            None
        } else {
            Some(self.used_bytes as f64 / self.max_bytes as f64)
        }
    }
}

/// The fast, ephemeral store that holds queues, the write buffer and the
/// read cache.
///
/// List semantics follow Redis: producers push to the front (LPUSH) and
/// workers pop from the back (RPOP), giving FIFO order per list. Every
/// mutation must be atomic on its own; callers add no extra locking.
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Push a value onto the front of a list.
    async fn push_front(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Pop a value from the back of a list without blocking.
    async fn pop_back(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Length of a list (0 when missing).
    async fn list_len(&self, key: &str) -> Result<u64, StorageError>;

    /// Read up to `limit` values from the front of a list without removing them.
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StorageError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Park a value until `ready_at_ms` (epoch millis).
    ///
    /// Identical values scheduled twice must both survive.
    async fn schedule(&self, delayed_key: &str, value: &str, ready_at_ms: i64) -> Result<(), StorageError>;

    /// Atomically move up to `limit` values whose ready time is `<= now_ms`
    /// from `delayed_key` onto the front of `queue_key`.
    ///
    /// Returns how many values were moved.
    async fn promote_due(
        &self,
        delayed_key: &str,
        queue_key: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<u64, StorageError>;

    /// Number of parked values.
    async fn delayed_len(&self, delayed_key: &str) -> Result<u64, StorageError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Memory usage, if the backend reports it.
    async fn memory_usage(&self) -> Result<Option<MemoryUsage>, StorageError> {
        Ok(None)
    }
}

/// The durable store documents are reconciled into.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert-or-update the document whose `filter_field` equals `key`.
    ///
    /// Fields in `document` are set; fields not mentioned are preserved. A
    /// uniqueness conflict must surface as [`StorageError::DuplicateKey`].
    async fn upsert(
        &self,
        collection: &str,
        filter_field: &str,
        key: &str,
        document: Document,
    ) -> Result<(), StorageError>;

    /// Fetch the document whose `field` equals `value`.
    async fn find_one(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<Document>, StorageError>;

    /// Remove `field` from every document in `collection` where it equals
    /// `value`, stamping `updated_at`. Returns the number of documents changed.
    async fn clear_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<u64, StorageError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), StorageError>;
}
