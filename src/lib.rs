// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Sync Reconciler
//!
//! A write-behind reconciliation pipeline: producers write to Redis and
//! queue a job, workers drain the queues into a durable document store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Producer                           │
//! │  • SET <type>:write:<key>, SET <type>:cache:<key>           │
//! │  • LPUSH sync:queue:<type>                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Redis (buffer store)                     │
//! │  • sync:queue:<type>    pending jobs                        │
//! │  • sync:delayed:<type>  parked retries, scored by ready-at  │
//! │  • sync:dlq:<type>      dead letters                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (N workers, round-robin, non-blocking pop)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Durable store (MongoDB or MySQL/SQLite)        │
//! │  • Upsert on the collection's natural key                   │
//! │  • Duplicate key counts as success                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A health monitor switches the pipeline into degraded mode when either
//! store is unreachable or slow; workers skip their cycles until it clears.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sync_reconciler::{ReconcilerConfig, ReconciliationService};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReconcilerConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         document_url: Some("mongodb://localhost:27017".into()),
//!         ..Default::default()
//!     };
//!
//!     let service = ReconciliationService::connect(config).await.expect("Failed to connect");
//!     service.start().await;
//!
//!     service
//!         .producer()
//!         .enqueue("citizen", "12345678901", "citizens", json!({"nome": "Test User"}))
//!         .await
//!         .expect("Failed to enqueue");
//!
//!     service.stop().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`reconciler`]: The [`ReconciliationService`], workers and background loops
//! - [`storage`]: Buffer and durable store backends (Redis, Mongo, SQL, Memory)
//! - [`resilience`]: Retry, requeue backoff, degraded mode
//! - [`sync_job`]: Queue envelope and key layout
//! - [`metrics`]: Metrics facade and the in-process registry

pub mod config;
pub mod sync_job;
pub mod storage;
pub mod resilience;
pub mod reconciler;
pub mod metrics;

pub use config::ReconcilerConfig;
pub use sync_job::{DeadLetterJob, SyncJob};
pub use reconciler::{
    BufferedReader, CycleReport, ExternalLookup, HandlerRegistry, JobError, JobOutcome,
    ReconciliationService, ServiceState, SpecialJobHandler, SyncProducer,
};
pub use storage::traits::{BufferStore, Document, DocumentStore, StorageError};
pub use resilience::retry::RetryConfig;
pub use resilience::degraded::DegradedMode;
pub use metrics::{LatencyTimer, MetricsRegistry};
