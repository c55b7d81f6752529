// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation service.
//!
//! The [`ReconciliationService`] owns every background task of the pipeline:
//! - N [`SyncWorker`]s draining the queues into the durable store
//! - the health monitor driving [`DegradedMode`]
//! - the [`DeadLetterWatchdog`] sampling queue depths
//! - the [`RequeueScheduler`] returning parked retries to their queues
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → Stopping → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sync_reconciler::{ReconcilerConfig, ReconciliationService, ServiceState};
//! use sync_reconciler::storage::memory::{InMemoryBufferStore, InMemoryDocumentStore};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let service = ReconciliationService::new(
//!     ReconcilerConfig::default(),
//!     Arc::new(InMemoryBufferStore::new()),
//!     Arc::new(InMemoryDocumentStore::new()),
//! );
//! assert_eq!(service.state(), ServiceState::Created);
//!
//! service.start().await;
//! service.stop().await;
//! assert_eq!(service.state(), ServiceState::Stopped);
//! # }
//! ```

mod lifecycle;
mod types;
pub mod handlers;
pub mod producer;
pub mod reader;
pub mod requeue;
pub mod watchdog;
pub mod worker;

pub use types::{CycleReport, JobError, JobOutcome, ServiceState};
pub use handlers::{ExternalLookup, HandlerRegistry, SpecialJobHandler};
pub use producer::SyncProducer;
pub use reader::{BufferedReader, ReadSource};
pub use requeue::RequeueScheduler;
pub use watchdog::{DeadLetterWatchdog, QueueDepths};
pub use worker::{Pipeline, SyncWorker};

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ReconcilerConfig;
use crate::metrics::MetricsRegistry;
use crate::resilience::backoff::RequeueBackoff;
use crate::resilience::degraded::{DegradedMode, HealthConfig};
use crate::storage::mongo::MongoDocumentStore;
use crate::storage::redis::RedisBufferStore;
use crate::storage::sql::SqlDocumentStore;
use crate::storage::traits::{BufferStore, DocumentStore, StorageError};

/// Spawned tasks and the signal that stops them.
struct RunningTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

pub struct ReconciliationService {
    pipeline: Arc<Pipeline>,
    state: watch::Sender<ServiceState>,
    state_rx: watch::Receiver<ServiceState>,
    tasks: Mutex<Option<RunningTasks>>,
}

impl ReconciliationService {
    /// Build a service over already-connected stores.
    ///
    /// Uses the standard handler table without an external lookup; see
    /// [`with_handlers`](Self::with_handlers).
    pub fn new(
        config: ReconcilerConfig,
        buffer: Arc<dyn BufferStore>,
        durable: Arc<dyn DocumentStore>,
    ) -> Self {
        let handlers = HandlerRegistry::standard(
            config.discriminator_field.clone(),
            Arc::clone(&durable),
            Arc::clone(&buffer),
            None,
        );
        let metrics = Arc::new(MetricsRegistry::new());
        let degraded = Arc::new(DegradedMode::new(
            HealthConfig::from_config(&config),
            Arc::clone(&metrics),
        ));
        let (state_tx, state_rx) = watch::channel(ServiceState::Created);

        Self {
            pipeline: Arc::new(Pipeline {
                buffer,
                durable,
                metrics,
                degraded,
                handlers: Arc::new(handlers),
                backoff: RequeueBackoff::from_config(&config),
                config: Arc::new(config),
            }),
            state: state_tx,
            state_rx,
            tasks: Mutex::new(None),
        }
    }

    /// Connect Redis and the durable store named by `document_url`.
    ///
    /// `mongodb://` and `mongodb+srv://` select Mongo; anything else is
    /// handed to the SQL store (`sqlite:` or `mysql://`).
    pub async fn connect(config: ReconcilerConfig) -> Result<Self, StorageError> {
        let redis_url = config
            .redis_url
            .clone()
            .ok_or_else(|| StorageError::Backend("redis_url is not configured".to_string()))?;
        let document_url = config
            .document_url
            .clone()
            .ok_or_else(|| StorageError::Backend("document_url is not configured".to_string()))?;

        let buffer = RedisBufferStore::with_prefix(&redis_url, config.redis_prefix.as_deref()).await?;
        info!("Buffer store connected");

        let durable: Arc<dyn DocumentStore> = if document_url.starts_with("mongodb") {
            Arc::new(MongoDocumentStore::connect(&document_url, &config.document_database).await?)
        } else {
            Arc::new(SqlDocumentStore::new(&document_url).await?)
        };
        info!("Durable store connected");

        Ok(Self::new(config, Arc::new(buffer), durable))
    }

    /// Replace the special-job handler table. Takes effect on the next
    /// [`start`](Self::start).
    #[must_use]
    pub fn with_handlers(self, handlers: HandlerRegistry) -> Self {
        let p = &self.pipeline;
        let pipeline = Arc::new(Pipeline {
            buffer: Arc::clone(&p.buffer),
            durable: Arc::clone(&p.durable),
            metrics: Arc::clone(&p.metrics),
            degraded: Arc::clone(&p.degraded),
            handlers: Arc::new(handlers),
            config: Arc::clone(&p.config),
            backoff: p.backoff,
        });
        Self { pipeline, ..self }
    }

    /// Standard handlers with `lookup` wired into the lookup handler.
    #[must_use]
    pub fn with_lookup(self, lookup: Arc<dyn ExternalLookup>) -> Self {
        let handlers = HandlerRegistry::standard(
            self.pipeline.config.discriminator_field.clone(),
            Arc::clone(&self.pipeline.durable),
            Arc::clone(&self.pipeline.buffer),
            Some(lookup),
        );
        self.with_handlers(handlers)
    }

    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.pipeline.config
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.pipeline.metrics)
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.pipeline.degraded.is_active()
    }

    #[must_use]
    pub fn degraded_mode(&self) -> Arc<DegradedMode> {
        Arc::clone(&self.pipeline.degraded)
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    /// A producer writing to this service's buffer store.
    #[must_use]
    pub fn producer(&self) -> SyncProducer {
        SyncProducer::new(Arc::clone(&self.pipeline.buffer), &self.pipeline.config)
    }

    /// A reader over this service's stores, counting into its metrics.
    #[must_use]
    pub fn reader(&self) -> BufferedReader {
        BufferedReader::new(
            Arc::clone(&self.pipeline.buffer),
            Arc::clone(&self.pipeline.durable),
            Arc::clone(&self.pipeline.metrics),
            Arc::clone(&self.pipeline.config),
        )
    }

    /// A detached worker sharing this service's pipeline, for driving
    /// cycles by hand.
    #[must_use]
    pub fn worker(&self, id: usize) -> SyncWorker {
        SyncWorker::new(id, Arc::clone(&self.pipeline))
    }
}
