// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process stores.
//!
//! [`InMemoryBufferStore`] mimics the Redis commands the pipeline relies on
//! (LPUSH/RPOP lists, SET with TTL, a scored delayed set) and
//! [`InMemoryDocumentStore`] mimics Mongo's `$set` upsert. Both can be told to
//! fail so tests can drive the retry, dead-letter and degraded paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::traits::{BufferStore, Document, DocumentStore, MemoryUsage, StorageError};

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

pub struct InMemoryBufferStore {
    lists: DashMap<String, VecDeque<String>>,
    values: DashMap<String, StoredValue>,
    delayed: DashMap<String, Vec<(i64, String)>>,
    reachable: AtomicBool,
    memory: Mutex<Option<MemoryUsage>>,
}

impl InMemoryBufferStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lists: DashMap::new(),
            values: DashMap::new(),
            delayed: DashMap::new(),
            reachable: AtomicBool::new(true),
            memory: Mutex::new(None),
        }
    }

    /// Make every operation fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Report fixed memory figures from [`BufferStore::memory_usage`].
    pub fn set_memory_usage(&self, usage: Option<MemoryUsage>) {
        *self.memory.lock() = usage;
    }

    /// Snapshot of a list, front to back.
    #[must_use]
    pub fn list(&self, key: &str) -> Vec<String> {
        self.lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of a delayed set as `(ready_at_ms, value)` pairs.
    #[must_use]
    pub fn delayed(&self, key: &str) -> Vec<(i64, String)> {
        self.delayed.get(key).map(|d| d.clone()).unwrap_or_default()
    }

    /// Remaining time-to-live of a value, `None` if missing or unbounded.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.values
            .get(key)
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Backend("buffer store unreachable".to_string()))
        }
    }
}

impl Default for InMemoryBufferStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BufferStore for InMemoryBufferStore {
    async fn push_front(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check()?;
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn pop_back(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        Ok(self.lists.get_mut(key).and_then(|mut l| l.pop_back()))
    }

    async fn list_len(&self, key: &str) -> Result<u64, StorageError> {
        self.check()?;
        Ok(self.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        self.check()?;
        Ok(self
            .lists
            .get(key)
            .map(|l| l.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        let expired = match self.values.get(key) {
            Some(v) if !v.is_expired() => return Ok(Some(v.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.values.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        self.check()?;
        self.values.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.values.remove(key);
        self.lists.remove(key);
        self.delayed.remove(key);
        Ok(())
    }

    async fn schedule(&self, delayed_key: &str, value: &str, ready_at_ms: i64) -> Result<(), StorageError> {
        self.check()?;
        self.delayed
            .entry(delayed_key.to_string())
            .or_default()
            .push((ready_at_ms, value.to_string()));
        Ok(())
    }

    async fn promote_due(
        &self,
        delayed_key: &str,
        queue_key: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<u64, StorageError> {
        self.check()?;
        let due: Vec<String> = match self.delayed.get_mut(delayed_key) {
            Some(mut entries) => {
                entries.sort_by_key(|(ready_at, _)| *ready_at);
                let count = entries
                    .iter()
                    .take_while(|(ready_at, _)| *ready_at <= now_ms)
                    .count()
                    .min(limit);
                entries.drain(..count).map(|(_, v)| v).collect()
            }
            None => return Ok(0),
        };

        if due.is_empty() {
            return Ok(0);
        }

        let mut queue = self.lists.entry(queue_key.to_string()).or_default();
        for value in &due {
            queue.push_front(value.clone());
        }
        Ok(due.len() as u64)
    }

    async fn delayed_len(&self, delayed_key: &str) -> Result<u64, StorageError> {
        self.check()?;
        Ok(self.delayed.get(delayed_key).map(|d| d.len() as u64).unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check()
    }

    async fn memory_usage(&self) -> Result<Option<MemoryUsage>, StorageError> {
        self.check()?;
        Ok(*self.memory.lock())
    }
}

/// How an [`InMemoryDocumentStore`] should misbehave.
#[derive(Debug, Clone)]
enum Failure {
    Always(StorageError),
    Times(u32, StorageError),
}

pub struct InMemoryDocumentStore {
    collections: DashMap<String, Vec<Document>>,
    failure: Mutex<Option<Failure>>,
    ping_delay: Mutex<Option<Duration>>,
    upsert_delay: Mutex<Option<Duration>>,
    upserts: AtomicU64,
}

impl InMemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            failure: Mutex::new(None),
            ping_delay: Mutex::new(None),
            upsert_delay: Mutex::new(None),
            upserts: AtomicU64::new(0),
        }
    }

    /// Fail every operation with `error` until [`clear_failure`](Self::clear_failure).
    pub fn fail_with(&self, error: StorageError) {
        *self.failure.lock() = Some(Failure::Always(error));
    }

    /// Fail the next `times` operations with `error`.
    pub fn fail_times(&self, times: u32, error: StorageError) {
        *self.failure.lock() = Some(Failure::Times(times, error));
    }

    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    /// Slow down [`DocumentStore::ping`].
    pub fn set_ping_delay(&self, delay: Option<Duration>) {
        *self.ping_delay.lock() = delay;
    }

    /// Slow down [`DocumentStore::upsert`].
    pub fn set_upsert_delay(&self, delay: Option<Duration>) {
        *self.upsert_delay.lock() = delay;
    }

    /// Number of upsert calls that reached the store (failed ones included).
    #[must_use]
    pub fn upsert_calls(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }

    /// All documents in a collection.
    #[must_use]
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|docs| docs.clone())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<(), StorageError> {
        let mut failure = self.failure.lock();
        match failure.take() {
            None => Ok(()),
            Some(Failure::Always(err)) => {
                *failure = Some(Failure::Always(err.clone()));
                Err(err)
            }
            Some(Failure::Times(0, _)) => Ok(()),
            Some(Failure::Times(n, err)) => {
                if n > 1 {
                    *failure = Some(Failure::Times(n - 1, err.clone()));
                }
                Err(err)
            }
        }
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn upsert(
        &self,
        collection: &str,
        filter_field: &str,
        key: &str,
        document: Document,
    ) -> Result<(), StorageError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.upsert_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;

        let key_value = Value::String(key.to_string());
        let mut docs = self.collections.entry(collection.to_string()).or_default();

        match docs.iter_mut().find(|d| d.get(filter_field) == Some(&key_value)) {
            Some(existing) => existing.extend(document),
            None => {
                let mut doc = Document::new();
                doc.insert(filter_field.to_string(), key_value);
                doc.extend(document);
                docs.push(doc);
            }
        }
        Ok(())
    }

    async fn find_one(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<Document>, StorageError> {
        self.check()?;
        let wanted = Value::String(value.to_string());
        Ok(self.collections.get(collection).and_then(|docs| {
            docs.iter().find(|d| d.get(field) == Some(&wanted)).cloned()
        }))
    }

    async fn clear_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<u64, StorageError> {
        self.check()?;
        let wanted = Value::String(value.to_string());
        let now = Value::String(chrono::Utc::now().to_rfc3339());

        let Some(mut docs) = self.collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut changed = 0;
        for doc in docs.iter_mut().filter(|d| d.get(field) == Some(&wanted)) {
            doc.remove(field);
            doc.insert("updated_at".to_string(), now.clone());
            changed += 1;
        }
        Ok(changed)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let delay = *self.ping_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()
    }
}
