// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation worker.
//!
//! Each worker wakes every `tick_ms` and runs one cycle:
//!
//! ```text
//! degraded? ── yes ──▶ skip cycle (no pops, no writes)
//!     │ no
//!     ▼
//! for queue in queues (round-robin), until max_jobs_per_cycle popped:
//!     RPOP sync:queue:<queue>
//!       └─▶ special handler or upsert (bounded by upsert_timeout)
//!             ├─ ok / duplicate key ─▶ SET <type>:cache:<key>, DEL <type>:write:<key>
//!             └─ error ─▶ retry_count += 1
//!                    ├─ retries left ─▶ ZADD sync:delayed:<queue> (ready at now + backoff)
//!                    └─ exhausted    ─▶ LPUSH sync:dlq:<type>
//! ```
//!
//! A popped job belongs to exactly one worker until it is synced, parked or
//! dead-lettered. Backoff never blocks the worker; the requeue scheduler
//! moves parked jobs back once they are due.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::handlers::HandlerRegistry;
use super::types::{CycleReport, JobError, JobOutcome};
use crate::config::ReconcilerConfig;
use crate::metrics::{record_cycle, record_job, record_lost_job, LatencyTimer, MetricsRegistry};
use crate::resilience::backoff::RequeueBackoff;
use crate::resilience::degraded::DegradedMode;
use crate::storage::traits::{BufferStore, DocumentStore, StorageError};
use crate::sync_job::{dead_letter_key, delayed_key, queue_key, DeadLetterJob, SyncJob};

/// Everything the pipeline tasks share.
pub struct Pipeline {
    pub buffer: Arc<dyn BufferStore>,
    pub durable: Arc<dyn DocumentStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub degraded: Arc<DegradedMode>,
    pub handlers: Arc<HandlerRegistry>,
    pub config: Arc<ReconcilerConfig>,
    pub backoff: RequeueBackoff,
}

pub struct SyncWorker {
    id: usize,
    pipeline: Arc<Pipeline>,
}

impl SyncWorker {
    pub fn new(id: usize, pipeline: Arc<Pipeline>) -> Self {
        Self { id, pipeline }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Cycle on every tick until `shutdown` flips or its sender is dropped.
    ///
    /// A cycle in progress always completes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.pipeline.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(worker_id = self.id, "Sync worker started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = self.id, "Sync worker stopped");
    }

    /// One pass over the queues.
    pub async fn run_cycle(&self) -> CycleReport {
        if self.pipeline.degraded.is_active() {
            debug!(
                worker_id = self.id,
                reason = ?self.pipeline.degraded.reason(),
                "Skipping cycle, degraded mode active"
            );
            return CycleReport::skipped();
        }

        let started = Instant::now();
        let budget = self.pipeline.config.max_jobs_per_cycle;
        let mut jobs_processed = 0;
        let mut report = CycleReport::default();

        for queue in &self.pipeline.config.queues {
            if jobs_processed >= budget {
                break;
            }
            let Some(raw) = self.pop_job(queue).await else {
                continue;
            };
            let outcome = match SyncJob::from_json(&raw) {
                Ok(job) => {
                    jobs_processed += 1;
                    self.process_job(queue, job).await
                }
                // Unparseable entries do not use the budget
                Err(e) => self.dead_letter_malformed(queue, &raw, &e.to_string()).await,
            };
            report.outcomes.push((queue.clone(), outcome));
        }

        if report.processed() > 0 {
            debug!(worker_id = self.id, jobs_processed = report.processed(), "Cycle complete");
            record_cycle(self.id, report.processed(), started.elapsed());
        }
        report
    }

    /// Non-blocking pop from `sync:queue:<queue>`.
    async fn pop_job(&self, queue: &str) -> Option<String> {
        match self.pipeline.buffer.pop_back(&queue_key(queue)).await {
            Ok(entry) => entry,
            Err(e) => {
                debug!(worker_id = self.id, queue, error = %e, "Failed to pop from queue");
                None
            }
        }
    }

    /// Drive one parsed job to a terminal or parked state.
    pub async fn process_job(&self, queue: &str, job: SyncJob) -> JobOutcome {
        let started = Instant::now();
        let job_id = job.id.clone();
        let job_type = job.job_type.clone();

        info!(
            worker_id = self.id,
            job_id = %job.id,
            job_type = %job.job_type,
            key = %job.key,
            collection = %job.collection,
            retry_count = job.retry_count,
            "Processing sync job"
        );

        let outcome = match self.execute(&job).await {
            Ok(outcome) => {
                self.handle_success(&job, &outcome).await;
                self.pipeline.metrics.record_sync_success(&job.job_type);
                outcome
            }
            Err(err) => {
                self.pipeline.metrics.record_sync_failure(&job.job_type);
                self.handle_failure(queue, job, err).await
            }
        };

        record_job(&job_type, outcome.label());
        info!(
            worker_id = self.id,
            job_id = %job_id,
            job_type = %job_type,
            outcome = outcome.label(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Sync job finished"
        );
        outcome
    }

    /// Special handler or generic upsert, bounded by the upsert timeout.
    async fn execute(&self, job: &SyncJob) -> Result<JobOutcome, JobError> {
        let limit = self.pipeline.config.upsert_timeout();
        timeout(limit, self.dispatch(job))
            .await
            .map_err(|_| JobError::Timeout(limit))?
    }

    async fn dispatch(&self, job: &SyncJob) -> Result<JobOutcome, JobError> {
        if let Some(handler) = self.pipeline.handlers.resolve(job) {
            debug!(job_id = %job.id, handler = handler.name(), "Dispatching special job");
            handler.handle(job).await?;
            return Ok(JobOutcome::Handled {
                handler: handler.name().to_string(),
            });
        }
        self.sync_to_store(job).await
    }

    /// Upsert the payload, matching on the collection's natural key.
    async fn sync_to_store(&self, job: &SyncJob) -> Result<JobOutcome, JobError> {
        if job.key.is_empty() {
            return Err(JobError::InvalidJob("empty key".to_string()));
        }
        if job.collection.is_empty() {
            return Err(JobError::InvalidJob("empty collection".to_string()));
        }
        let document = job.document().map_err(JobError::Malformed)?;
        let filter_field = self.pipeline.config.filter_field_for(&job.collection);

        let _timer = LatencyTimer::new(&job.job_type);
        match self
            .pipeline
            .durable
            .upsert(&job.collection, filter_field, &job.key, document)
            .await
        {
            Ok(()) => Ok(JobOutcome::Synced),
            Err(e) if e.is_duplicate_key() => {
                debug!(
                    job_id = %job.id,
                    collection = %job.collection,
                    key = %job.key,
                    "Duplicate key during sync, document already present"
                );
                Ok(JobOutcome::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh the read cache, then drop the write-buffer entry.
    ///
    /// Both steps are best-effort: the durable write already happened.
    /// Handled jobs are terminal and touch neither key.
    async fn handle_success(&self, job: &SyncJob, outcome: &JobOutcome) {
        if matches!(outcome, JobOutcome::Handled { .. }) {
            return;
        }
        let buffer = &self.pipeline.buffer;

        match serde_json::to_string(&job.data) {
            Ok(payload) => {
                let ttl = self.pipeline.config.synced_cache_ttl();
                if let Err(e) = buffer.set(&job.cache_key(), &payload, Some(ttl)).await {
                    error!(job_id = %job.id, cache_key = %job.cache_key(), error = %e, "Failed to refresh read cache");
                }
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to encode payload for read cache"),
        }

        if let Err(e) = buffer.delete(&job.write_key()).await {
            warn!(job_id = %job.id, write_key = %job.write_key(), error = %e, "Failed to clean up write buffer");
        }
    }

    /// Count the failure and either park the job or dead-letter it.
    async fn handle_failure(&self, queue: &str, mut job: SyncJob, err: JobError) -> JobOutcome {
        let exhausted = job.record_failure();
        warn!(
            worker_id = self.id,
            job_id = %job.id,
            job_type = %job.job_type,
            retry_count = job.retry_count,
            max_retries = job.max_retries,
            error_kind = err.kind(),
            error = %err,
            "Sync job failed"
        );

        if exhausted {
            self.dead_letter(job, &err.to_string()).await
        } else {
            self.schedule_retry(queue, job).await
        }
    }

    async fn dead_letter(&self, job: SyncJob, error: &str) -> JobOutcome {
        let entry = DeadLetterJob::new(job, error);
        let job = &entry.original_job;
        let key = job.dead_letter_key();

        let payload = match entry.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(job_id = %job.id, job = ?entry, error = %e, "Failed to encode dead-letter entry, job lost");
                record_lost_job(&job.job_type);
                return JobOutcome::Lost;
            }
        };

        match self.pipeline.buffer.push_front(&key, &payload).await {
            Ok(()) => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    key = %job.key,
                    retry_count = job.retry_count,
                    error = %entry.error,
                    "Job moved to dead-letter queue"
                );
                JobOutcome::DeadLettered
            }
            Err(e) => {
                error!(job_id = %job.id, payload = %payload, error = %e, "Failed to dead-letter job, job lost");
                record_lost_job(&job.job_type);
                JobOutcome::Lost
            }
        }
    }

    /// Park the job in `sync:delayed:<queue>` until its backoff elapses.
    async fn schedule_retry(&self, queue: &str, job: SyncJob) -> JobOutcome {
        let backoff = self.pipeline.backoff;
        let delay = backoff.delay_for(job.retry_count);
        let ready_at = backoff.ready_at_ms(Utc::now().timestamp_millis(), job.retry_count);

        let payload = match job.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(job_id = %job.id, job = ?job, error = %e, "Failed to encode job for retry, job lost");
                record_lost_job(&job.job_type);
                return JobOutcome::Lost;
            }
        };

        let buffer = &self.pipeline.buffer;
        match buffer.schedule(&delayed_key(queue), &payload, ready_at).await {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    retry_count = job.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Job scheduled for retry"
                );
                JobOutcome::Retrying {
                    retry_count: job.retry_count,
                    delay,
                }
            }
            Err(e) => {
                // An immediate retry beats losing the job
                warn!(job_id = %job.id, error = %e, "Failed to park job, requeueing without delay");
                match buffer.push_front(&queue_key(queue), &payload).await {
                    Ok(()) => JobOutcome::Retrying {
                        retry_count: job.retry_count,
                        delay: Duration::ZERO,
                    },
                    Err(e) => {
                        error!(job_id = %job.id, payload = %payload, error = %e, "Failed to requeue job, job lost");
                        record_lost_job(&job.job_type);
                        JobOutcome::Lost
                    }
                }
            }
        }
    }

    /// Dead-letter a queue entry that is not a SyncJob at all.
    async fn dead_letter_malformed(&self, queue: &str, raw: &str, error: &str) -> JobOutcome {
        error!(worker_id = self.id, queue, error, "Failed to parse queue entry");
        self.pipeline.metrics.record_sync_failure(queue);
        record_job(queue, JobOutcome::DeadLettered.label());

        let entry = DeadLetterJob::malformed(queue, raw, error);
        let pushed = match entry.to_json() {
            Ok(payload) => self.pipeline.buffer.push_front(&dead_letter_key(queue), &payload).await,
            Err(e) => {
                error!(queue, error = %e, "Failed to encode malformed entry");
                // Fall through to the requeue below
                Err(StorageError::Serialization(e.to_string()))
            }
        };

        match pushed {
            Ok(()) => JobOutcome::DeadLettered,
            Err(e) => {
                warn!(queue, error = %e, "Failed to dead-letter malformed entry, returning it to the queue");
                if let Err(e) = self.pipeline.buffer.push_front(&queue_key(queue), raw).await {
                    error!(queue, raw, error = %e, "Failed to return malformed entry, entry lost");
                    record_lost_job(queue);
                    return JobOutcome::Lost;
                }
                JobOutcome::Retrying {
                    retry_count: 0,
                    delay: Duration::ZERO,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::degraded::HealthConfig;
    use crate::storage::memory::{InMemoryBufferStore, InMemoryDocumentStore};
    use serde_json::json;

    struct Fixture {
        buffer: Arc<InMemoryBufferStore>,
        durable: Arc<InMemoryDocumentStore>,
        pipeline: Arc<Pipeline>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(ReconcilerConfig::default())
        }

        fn with_config(config: ReconcilerConfig) -> Self {
            let buffer = Arc::new(InMemoryBufferStore::new());
            let durable = Arc::new(InMemoryDocumentStore::new());
            let metrics = Arc::new(MetricsRegistry::new());
            let pipeline = Arc::new(Pipeline {
                buffer: buffer.clone(),
                durable: durable.clone(),
                metrics: metrics.clone(),
                degraded: Arc::new(DegradedMode::new(HealthConfig::default(), metrics)),
                handlers: Arc::new(HandlerRegistry::standard(
                    "type",
                    durable.clone(),
                    buffer.clone(),
                    None,
                )),
                backoff: RequeueBackoff::from_config(&config),
                config: Arc::new(config),
            });
            Self { buffer, durable, pipeline }
        }

        fn worker(&self) -> SyncWorker {
            SyncWorker::new(0, self.pipeline.clone())
        }

        async fn enqueue(&self, job: &SyncJob) {
            self.buffer
                .push_front(&job.queue_key(), &job.to_json().unwrap())
                .await
                .unwrap();
        }
    }

    fn citizen() -> SyncJob {
        SyncJob::new(
            "citizen",
            "12345678901",
            "citizens",
            json!({"cpf": "12345678901", "nome": "Test User"}),
        )
    }

    #[tokio::test]
    async fn test_successful_sync() {
        let fx = Fixture::new();
        let job = citizen();
        fx.buffer.set(&job.write_key(), "{}", None).await.unwrap();
        fx.enqueue(&job).await;

        let report = fx.worker().run_cycle().await;
        assert_eq!(report.outcomes, vec![("citizen".to_string(), JobOutcome::Synced)]);

        let doc = fx.durable.find_one("citizens", "cpf", "12345678901").await.unwrap().unwrap();
        assert_eq!(doc["nome"], "Test User");

        let cached = fx.buffer.get(&job.cache_key()).await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(&cached).unwrap(), job.data);
        assert!(fx.buffer.ttl(&job.cache_key()).unwrap() > Duration::from_secs(10_000));
        assert_eq!(fx.buffer.get(&job.write_key()).await.unwrap(), None);
        assert_eq!(fx.pipeline.metrics.sync_successes("citizen"), 1);
    }

    #[tokio::test]
    async fn test_budget_limits_cycle() {
        let fx = Fixture::new();
        let queues = ["citizen", "phone_mapping", "user_config", "opt_in_history", "beta_group"];
        for queue in queues {
            fx.enqueue(&SyncJob::new(queue, "1", "docs", json!({}))).await;
        }

        let report = fx.worker().run_cycle().await;
        assert_eq!(report.processed(), 3);
        assert_eq!(fx.buffer.list_len("sync:queue:opt_in_history").await.unwrap(), 1);
        assert_eq!(fx.buffer.list_len("sync:queue:beta_group").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_one_job_per_queue_per_cycle() {
        let fx = Fixture::new();
        for i in 0..3 {
            fx.enqueue(&SyncJob::new("citizen", format!("{}", i), "citizens", json!({}))).await;
        }

        let report = fx.worker().run_cycle().await;
        assert_eq!(report.processed(), 1);
        assert_eq!(fx.buffer.list_len("sync:queue:citizen").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unparseable_entries_outside_budget() {
        let fx = Fixture::new();
        fx.buffer.push_front("sync:queue:citizen", "{oops").await.unwrap();
        for queue in ["phone_mapping", "user_config", "opt_in_history"] {
            fx.enqueue(&SyncJob::new(queue, "1", "docs", json!({}))).await;
        }

        let report = fx.worker().run_cycle().await;
        assert_eq!(report.processed(), 4);
        assert_eq!(report.count("dead_letter"), 1);
        assert_eq!(report.count("synced"), 3);
        assert_eq!(fx.buffer.list_len("sync:queue:opt_in_history").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_round_robin_across_queues() {
        let fx = Fixture::new();
        for (job_type, collection) in [("citizen", "citizens"), ("phone_mapping", "phone_cpf_mappings")] {
            for i in 0..2 {
                fx.enqueue(&SyncJob::new(job_type, format!("{}", i), collection, json!({}))).await;
            }
        }

        let report = fx.worker().run_cycle().await;
        let queues: Vec<&str> = report.outcomes.iter().map(|(q, _)| q.as_str()).collect();
        assert_eq!(queues, vec!["citizen", "phone_mapping"]);
    }

    #[tokio::test]
    async fn test_degraded_skips_cycle() {
        let fx = Fixture::new();
        fx.enqueue(&citizen()).await;
        fx.pipeline.degraded.activate("durable_store_down");

        let report = fx.worker().run_cycle().await;
        assert!(report.skipped);
        assert_eq!(fx.buffer.list_len("sync:queue:citizen").await.unwrap(), 1);
        assert_eq!(fx.durable.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_parks_job_with_incremented_count() {
        let fx = Fixture::new();
        fx.durable.fail_with(StorageError::Backend("connection reset".into()));
        fx.enqueue(&citizen()).await;

        let report = fx.worker().run_cycle().await;
        assert_eq!(
            report.outcomes[0].1,
            JobOutcome::Retrying { retry_count: 1, delay: Duration::from_secs(5) }
        );

        let parked = fx.buffer.delayed("sync:delayed:citizen");
        assert_eq!(parked.len(), 1);
        let job = SyncJob::from_json(&parked[0].1).unwrap();
        assert_eq!(job.retry_count, 1);
        assert!(fx.buffer.list("sync:dlq:citizen").is_empty());
        assert_eq!(fx.pipeline.metrics.sync_failures("citizen"), 1);
    }

    #[tokio::test]
    async fn test_exhausted_job_dead_lettered_once() {
        let fx = Fixture::new();
        fx.durable.fail_with(StorageError::Backend("connection reset".into()));
        let mut job = citizen();
        job.retry_count = 2;
        fx.enqueue(&job).await;

        let report = fx.worker().run_cycle().await;
        assert_eq!(report.outcomes[0].1, JobOutcome::DeadLettered);

        let dlq = fx.buffer.list("sync:dlq:citizen");
        assert_eq!(dlq.len(), 1);
        let entry = DeadLetterJob::from_json(&dlq[0]).unwrap();
        assert_eq!(entry.original_job.id, job.id);
        assert_eq!(entry.original_job.retry_count, 3);
        assert!(entry.error.contains("connection reset"));
        assert_eq!(fx.buffer.delayed_len("sync:delayed:citizen").await.unwrap(), 0);
        assert_eq!(fx.buffer.list_len("sync:queue:citizen").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_success() {
        let fx = Fixture::new();
        fx.durable.fail_with(StorageError::DuplicateKey("E11000".into()));
        let job = citizen();
        fx.buffer.set(&job.write_key(), "{}", None).await.unwrap();
        fx.enqueue(&job).await;

        let report = fx.worker().run_cycle().await;
        assert_eq!(report.outcomes[0].1, JobOutcome::Duplicate);
        assert_eq!(fx.pipeline.metrics.sync_failures("citizen"), 0);
        assert!(fx.buffer.list("sync:dlq:citizen").is_empty());
        assert_eq!(fx.buffer.get(&job.write_key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_non_object_payload_retries() {
        let fx = Fixture::new();
        fx.enqueue(&SyncJob::new("citizen", "1", "citizens", json!("not a document"))).await;

        let report = fx.worker().run_cycle().await;
        assert!(matches!(report.outcomes[0].1, JobOutcome::Retrying { retry_count: 1, .. }));
        assert_eq!(fx.durable.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_entry_dead_lettered() {
        let fx = Fixture::new();
        fx.buffer.push_front("sync:queue:citizen", "{oops").await.unwrap();

        let report = fx.worker().run_cycle().await;
        assert_eq!(report.outcomes[0].1, JobOutcome::DeadLettered);

        let entry = DeadLetterJob::from_json(&fx.buffer.list("sync:dlq:citizen")[0]).unwrap();
        assert_eq!(entry.original_job.data, json!("{oops"));
    }

    #[tokio::test]
    async fn test_filter_field_from_collection_keys() {
        let fx = Fixture::new();
        fx.enqueue(&SyncJob::new("phone_mapping", "5521999999999", "phone_cpf_mappings", json!({"cpf": "1"}))).await;
        fx.enqueue(&SyncJob::new("citizen", "abc", "pets", json!({"name": "Rex"}))).await;

        fx.worker().run_cycle().await;

        let mapping = fx.durable.documents("phone_cpf_mappings");
        assert_eq!(mapping[0]["phone_number"], "5521999999999");
        let pet = fx.durable.documents("pets");
        assert_eq!(pet[0]["_id"], "abc");
    }

    #[tokio::test]
    async fn test_special_job_dispatch() {
        let fx = Fixture::new();
        let data = |avatar: &str| json!({"avatar_id": avatar});
        fx.durable
            .upsert("user_config", "cpf", "1", data("a").as_object().cloned().unwrap())
            .await
            .unwrap();

        let job = SyncJob::new("user_config", "a", "user_config", json!({"type": "avatar_cleanup", "avatar_id": "a"}));
        fx.buffer.set(&job.write_key(), "pending", None).await.unwrap();
        fx.enqueue(&job).await;

        let report = fx.worker().run_cycle().await;
        assert_eq!(
            report.outcomes[0].1,
            JobOutcome::Handled { handler: "reference_cleanup".to_string() }
        );
        let doc = fx.durable.find_one("user_config", "cpf", "1").await.unwrap().unwrap();
        assert!(doc.get("avatar_id").is_none());
        // Handled jobs leave both buffer keys alone
        assert_eq!(fx.buffer.get(&job.cache_key()).await.unwrap(), None);
        assert_eq!(fx.buffer.get(&job.write_key()).await.unwrap().as_deref(), Some("pending"));
    }

    #[tokio::test]
    async fn test_upsert_timeout_is_failure() {
        let fx = Fixture::with_config(ReconcilerConfig {
            upsert_timeout_secs: 1,
            ..Default::default()
        });
        fx.durable.set_upsert_delay(Some(Duration::from_secs(5)));
        fx.enqueue(&citizen()).await;

        let report = fx.worker().run_cycle().await;
        assert!(matches!(report.outcomes[0].1, JobOutcome::Retrying { retry_count: 1, .. }));
        assert!(fx.durable.documents("citizens").is_empty());
        assert_eq!(fx.buffer.delayed_len("sync:delayed:citizen").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cache_refresh_failure_still_success() {
        let fx = Fixture::new();
        let worker = fx.worker();
        let job = citizen();

        // Buffer goes away after the job was popped
        fx.buffer.set_reachable(false);
        let outcome = worker.process_job("citizen", job).await;
        assert_eq!(outcome, JobOutcome::Synced);
        assert_eq!(fx.durable.documents("citizens").len(), 1);
    }

    #[tokio::test]
    async fn test_worker_stops_on_signal() {
        let fx = Fixture::with_config(ReconcilerConfig { tick_ms: 5, ..Default::default() });
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(fx.worker().run(rx));

        fx.enqueue(&citizen()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.durable.documents("citizens").len(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    /// Records the keys written and deleted, in order.
    struct RecordingBuffer {
        inner: InMemoryBufferStore,
        calls: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl BufferStore for RecordingBuffer {
        async fn push_front(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.inner.push_front(key, value).await
        }

        async fn pop_back(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.pop_back(key).await
        }

        async fn list_len(&self, key: &str) -> Result<u64, StorageError> {
            self.inner.list_len(key).await
        }

        async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StorageError> {
            self.inner.list_range(key, limit).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
            self.calls.lock().push(format!("set {}", key));
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.calls.lock().push(format!("delete {}", key));
            self.inner.delete(key).await
        }

        async fn schedule(&self, delayed_key: &str, value: &str, ready_at_ms: i64) -> Result<(), StorageError> {
            self.inner.schedule(delayed_key, value, ready_at_ms).await
        }

        async fn promote_due(
            &self,
            delayed_key: &str,
            queue_key: &str,
            now_ms: i64,
            limit: usize,
        ) -> Result<u64, StorageError> {
            self.inner.promote_due(delayed_key, queue_key, now_ms, limit).await
        }

        async fn delayed_len(&self, delayed_key: &str) -> Result<u64, StorageError> {
            self.inner.delayed_len(delayed_key).await
        }

        async fn ping(&self) -> Result<(), StorageError> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_cache_refreshed_before_write_buffer_deleted() {
        let buffer = Arc::new(RecordingBuffer {
            inner: InMemoryBufferStore::new(),
            calls: parking_lot::Mutex::new(Vec::new()),
        });
        let durable = Arc::new(InMemoryDocumentStore::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let config = ReconcilerConfig::default();
        let pipeline = Arc::new(Pipeline {
            buffer: buffer.clone(),
            durable: durable.clone(),
            metrics: metrics.clone(),
            degraded: Arc::new(DegradedMode::new(HealthConfig::default(), metrics)),
            handlers: Arc::new(HandlerRegistry::default()),
            backoff: RequeueBackoff::from_config(&config),
            config: Arc::new(config),
        });

        let outcome = SyncWorker::new(0, pipeline).process_job("citizen", citizen()).await;
        assert_eq!(outcome, JobOutcome::Synced);

        let calls = buffer.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                "set citizen:cache:12345678901".to_string(),
                "delete citizen:write:12345678901".to_string(),
            ]
        );
    }
}
