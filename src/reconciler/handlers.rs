// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Special jobs: queue entries that are not plain upserts.
//!
//! A job is routed to a handler when either
//! - its payload discriminator (`data[<discriminator_field>]`, default
//!   `"type"`) names a registered handler, or
//! - its job type or collection names one.
//!
//! The discriminator is checked first. Unmatched jobs take the generic
//! upsert path. A handler error goes through the normal retry/dead-letter
//! path.
//!
//! Two handlers ship with the crate:
//! - [`ReferenceCleanupHandler`]: unset a field everywhere it references a
//!   deleted value (registered for `avatar_cleanup` payloads)
//! - [`LookupHandler`]: run an external lookup, then drop a derived cache
//!   entry (registered for the `cf_lookup` job type)

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::types::JobError;
use crate::storage::traits::{BufferStore, DocumentStore};
use crate::sync_job::SyncJob;

pub const REFERENCE_CLEANUP: &str = "avatar_cleanup";
pub const LOOKUP: &str = "cf_lookup";

#[async_trait]
pub trait SpecialJobHandler: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    async fn handle(&self, job: &SyncJob) -> Result<(), JobError>;
}

/// Maps job types and discriminator values to handlers.
pub struct HandlerRegistry {
    discriminator_field: String,
    by_discriminator: HashMap<String, Arc<dyn SpecialJobHandler>>,
    by_job_type: HashMap<String, Arc<dyn SpecialJobHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new(discriminator_field: impl Into<String>) -> Self {
        Self {
            discriminator_field: discriminator_field.into(),
            by_discriminator: HashMap::new(),
            by_job_type: HashMap::new(),
        }
    }

    /// The production table: reference cleanup on the `avatar_cleanup`
    /// discriminator and the external lookup on the `cf_lookup` job type.
    pub fn standard(
        discriminator_field: impl Into<String>,
        durable: Arc<dyn DocumentStore>,
        buffer: Arc<dyn BufferStore>,
        lookup: Option<Arc<dyn ExternalLookup>>,
    ) -> Self {
        Self::new(discriminator_field)
            .with_discriminator(
                REFERENCE_CLEANUP,
                Arc::new(ReferenceCleanupHandler::new(durable, "user_config", "avatar_id")),
            )
            .with_job_type(LOOKUP, Arc::new(LookupHandler::new(lookup, buffer)))
    }

    /// Route jobs whose payload discriminator equals `value`.
    #[must_use]
    pub fn with_discriminator(mut self, value: &str, handler: Arc<dyn SpecialJobHandler>) -> Self {
        self.by_discriminator.insert(value.to_string(), handler);
        self
    }

    /// Route jobs whose type (or collection) equals `job_type`.
    #[must_use]
    pub fn with_job_type(mut self, job_type: &str, handler: Arc<dyn SpecialJobHandler>) -> Self {
        self.by_job_type.insert(job_type.to_string(), handler);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_discriminator.is_empty() && self.by_job_type.is_empty()
    }

    /// Handler for `job`, or `None` for the generic path.
    #[must_use]
    pub fn resolve(&self, job: &SyncJob) -> Option<Arc<dyn SpecialJobHandler>> {
        if let Some(handler) = job
            .data_str(&self.discriminator_field)
            .and_then(|value| self.by_discriminator.get(value))
        {
            return Some(Arc::clone(handler));
        }

        self.by_job_type
            .get(&job.job_type)
            .or_else(|| self.by_job_type.get(&job.collection))
            .cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new("type")
    }
}

/// Removes a dangling reference from every document that holds it.
///
/// The payload must carry the deleted value under `field`.
pub struct ReferenceCleanupHandler {
    durable: Arc<dyn DocumentStore>,
    collection: String,
    field: String,
}

impl ReferenceCleanupHandler {
    pub fn new(durable: Arc<dyn DocumentStore>, collection: &str, field: &str) -> Self {
        Self {
            durable,
            collection: collection.to_string(),
            field: field.to_string(),
        }
    }
}

#[async_trait]
impl SpecialJobHandler for ReferenceCleanupHandler {
    fn name(&self) -> &str {
        "reference_cleanup"
    }

    async fn handle(&self, job: &SyncJob) -> Result<(), JobError> {
        let value = job
            .data_str(&self.field)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| JobError::handler(self.name(), format!("missing or invalid {}", self.field)))?;

        let affected = self
            .durable
            .clear_field(&self.collection, &self.field, value)
            .await
            .map_err(|e| JobError::handler(self.name(), e.to_string()))?;

        info!(
            job_id = %job.id,
            collection = %self.collection,
            field = %self.field,
            value,
            affected,
            "Cleared dangling references"
        );
        Ok(())
    }
}

pub type LookupError = Box<dyn std::error::Error + Send + Sync>;

/// An external service resolving data for a key (e.g. a health-unit lookup
/// by address). Injected by the host application.
#[async_trait]
pub trait ExternalLookup: Send + Sync {
    async fn lookup(&self, key: &str, input: &str) -> Result<(), LookupError>;
}

/// Runs an [`ExternalLookup`] for `data.cpf` / `data.address`, then deletes
/// `citizen_wallet:<cpf>` so readers pick up the new data.
pub struct LookupHandler {
    lookup: Option<Arc<dyn ExternalLookup>>,
    buffer: Arc<dyn BufferStore>,
    key_field: String,
    input_field: String,
    invalidate_prefix: String,
}

impl LookupHandler {
    pub fn new(lookup: Option<Arc<dyn ExternalLookup>>, buffer: Arc<dyn BufferStore>) -> Self {
        Self {
            lookup,
            buffer,
            key_field: "cpf".to_string(),
            input_field: "address".to_string(),
            invalidate_prefix: "citizen_wallet:".to_string(),
        }
    }

    fn required<'a>(&self, job: &'a SyncJob, field: &str) -> Result<&'a str, JobError> {
        job.data_str(field)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| JobError::handler(self.name(), format!("missing or invalid {}", field)))
    }
}

#[async_trait]
impl SpecialJobHandler for LookupHandler {
    fn name(&self) -> &str {
        "lookup"
    }

    async fn handle(&self, job: &SyncJob) -> Result<(), JobError> {
        if !job.data.is_object() {
            return Err(JobError::handler(self.name(), "job data is not a document"));
        }
        let key = self.required(job, &self.key_field)?;
        let input = self.required(job, &self.input_field)?;

        let lookup = self
            .lookup
            .as_ref()
            .ok_or_else(|| JobError::handler(self.name(), "lookup service not configured"))?;

        lookup
            .lookup(key, input)
            .await
            .map_err(|e| JobError::handler(self.name(), e.to_string()))?;

        info!(job_id = %job.id, key, "External lookup completed");

        // Stale derived cache only costs freshness, never fail the job for it
        let derived = format!("{}{}", self.invalidate_prefix, key);
        match self.buffer.delete(&derived).await {
            Ok(()) => debug!(cache_key = %derived, "Invalidated derived cache"),
            Err(e) => warn!(cache_key = %derived, error = %e, "Failed to invalidate derived cache"),
        }
        Ok(())
    }
}
