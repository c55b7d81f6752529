// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Producer side of the write-behind contract.
//!
//! A write is visible to readers as soon as [`SyncProducer::enqueue`]
//! returns: the payload lands in the write buffer and the read cache before
//! the job is queued for the durable store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::config::ReconcilerConfig;
use crate::storage::traits::{BufferStore, StorageError};
use crate::sync_job::SyncJob;

pub struct SyncProducer {
    buffer: Arc<dyn BufferStore>,
    write_buffer_ttl: Duration,
    cache_ttl: Duration,
    max_retries: u32,
}

impl SyncProducer {
    pub fn new(buffer: Arc<dyn BufferStore>, config: &ReconcilerConfig) -> Self {
        Self {
            buffer,
            write_buffer_ttl: config.write_buffer_ttl(),
            cache_ttl: config.read_cache_ttl(),
            max_retries: config.default_max_retries,
        }
    }

    /// Buffer `data` for `key` and queue it for the durable store.
    ///
    /// Returns the queued job. A failure after the write buffer was set
    /// leaves the buffered value in place; callers retry the whole call.
    pub async fn enqueue(
        &self,
        job_type: &str,
        key: &str,
        collection: &str,
        data: Value,
    ) -> Result<SyncJob, StorageError> {
        let job = SyncJob::new(job_type, key, collection, data).with_max_retries(self.max_retries);
        let payload =
            serde_json::to_string(&job.data).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let entry = job
            .to_json()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        self.buffer
            .set(&job.write_key(), &payload, Some(self.write_buffer_ttl))
            .await?;
        self.buffer
            .set(&job.cache_key(), &payload, Some(self.cache_ttl))
            .await?;
        self.buffer.push_front(&job.queue_key(), &entry).await?;

        debug!(job_id = %job.id, job_type, key, "Sync job queued");
        Ok(job)
    }
}
