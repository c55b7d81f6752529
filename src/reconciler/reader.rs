// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reader side of the write-behind contract: read cache, then write buffer,
//! then the durable store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ReconcilerConfig;
use crate::metrics::MetricsRegistry;
use crate::storage::traits::{BufferStore, DocumentStore, StorageError};
use crate::sync_job::{cache_key, write_key};

/// Where a read was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Cache,
    WriteBuffer,
    Durable,
}

pub struct BufferedReader {
    buffer: Arc<dyn BufferStore>,
    durable: Arc<dyn DocumentStore>,
    metrics: Arc<MetricsRegistry>,
    config: Arc<ReconcilerConfig>,
}

impl BufferedReader {
    pub fn new(
        buffer: Arc<dyn BufferStore>,
        durable: Arc<dyn DocumentStore>,
        metrics: Arc<MetricsRegistry>,
        config: Arc<ReconcilerConfig>,
    ) -> Self {
        Self {
            buffer,
            durable,
            metrics,
            config,
        }
    }

    /// Read the latest value for `key`.
    ///
    /// Buffer-store failures fall through to the next source; only a
    /// durable-store failure is returned. Cache hits and misses are counted
    /// per `job_type`.
    pub async fn read(
        &self,
        job_type: &str,
        key: &str,
        collection: &str,
    ) -> Result<Option<(Value, ReadSource)>, StorageError> {
        if let Some(value) = self.buffered(&cache_key(job_type, key)).await {
            self.metrics.record_cache_hit(job_type);
            return Ok(Some((value, ReadSource::Cache)));
        }
        self.metrics.record_cache_miss(job_type);

        // Pending writes are newer than anything durable
        if let Some(value) = self.buffered(&write_key(job_type, key)).await {
            return Ok(Some((value, ReadSource::WriteBuffer)));
        }

        let filter_field = self.config.filter_field_for(collection);
        let Some(document) = self.durable.find_one(collection, filter_field, key).await? else {
            debug!(job_type, key, collection, "Read missed every source");
            return Ok(None);
        };

        let value = Value::Object(document);
        self.repopulate(job_type, key, &value, self.config.read_cache_ttl()).await;
        Ok(Some((value, ReadSource::Durable)))
    }

    async fn buffered(&self, buffer_key: &str) -> Option<Value> {
        let raw = match self.buffer.get(buffer_key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = buffer_key, error = %e, "Buffer read failed, falling through");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = buffer_key, error = %e, "Ignoring undecodable buffered value");
                None
            }
        }
    }

    async fn repopulate(&self, job_type: &str, key: &str, value: &Value, ttl: Duration) {
        let payload = value.to_string();
        if let Err(e) = self.buffer.set(&cache_key(job_type, key), &payload, Some(ttl)).await {
            warn!(job_type, key, error = %e, "Failed to repopulate read cache");
        }
    }
}
