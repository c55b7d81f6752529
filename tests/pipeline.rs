// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end pipeline behaviour over the in-memory stores.
//!
//! No Docker needed:
//! ```bash
//! cargo test --test pipeline
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use sync_reconciler::resilience::backoff::RequeueBackoff;
use sync_reconciler::storage::memory::{InMemoryBufferStore, InMemoryDocumentStore};
use sync_reconciler::{
    BufferStore, DeadLetterJob, DocumentStore, JobOutcome, ReconcilerConfig, ReconciliationService,
    StorageError, SyncJob,
};

// =============================================================================
// Helpers
// =============================================================================

struct Harness {
    service: ReconciliationService,
    buffer: Arc<InMemoryBufferStore>,
    durable: Arc<InMemoryDocumentStore>,
}

fn harness(config: ReconcilerConfig) -> Harness {
    let buffer = Arc::new(InMemoryBufferStore::new());
    let durable = Arc::new(InMemoryDocumentStore::new());
    let service = ReconciliationService::new(config, buffer.clone(), durable.clone());
    Harness {
        service,
        buffer,
        durable,
    }
}

async fn push(buffer: &InMemoryBufferStore, job: &SyncJob) {
    buffer
        .push_front(&job.queue_key(), &job.to_json().unwrap())
        .await
        .unwrap();
}

/// Move every parked retry back to its queue regardless of backoff.
async fn release_delayed(buffer: &InMemoryBufferStore, queue: &str) -> u64 {
    buffer
        .promote_due(
            &format!("sync:delayed:{}", queue),
            &format!("sync:queue:{}", queue),
            i64::MAX,
            1_000,
        )
        .await
        .unwrap()
}

fn citizen_job() -> SyncJob {
    SyncJob::new(
        "citizen",
        "12345678901",
        "citizens",
        json!({"cpf": "12345678901", "nome": "Test User"}),
    )
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn happy_citizen_job_synced_and_cached() {
    let h = harness(ReconcilerConfig::default());
    let job = citizen_job();
    h.buffer.set(&job.write_key(), &job.data.to_string(), None).await.unwrap();
    push(&h.buffer, &job).await;

    let report = h.service.worker(0).run_cycle().await;
    assert_eq!(report.count("synced"), 1);

    let doc = h
        .durable
        .find_one("citizens", "cpf", "12345678901")
        .await
        .unwrap()
        .expect("document upserted");
    assert_eq!(doc["nome"], "Test User");

    let cached: Value = serde_json::from_str(
        &h.buffer.get("citizen:cache:12345678901").await.unwrap().expect("cache refreshed"),
    )
    .unwrap();
    assert_eq!(cached, job.data);
    assert_eq!(h.buffer.get("citizen:write:12345678901").await.unwrap(), None);
    assert_eq!(h.service.metrics().sync_successes("citizen"), 1);
    assert!(h.service.metrics().last_success("citizen").is_some());
}

#[tokio::test]
async fn happy_producer_to_reader_round_trip() {
    let h = harness(ReconcilerConfig::default());
    let producer = h.service.producer();
    let reader = h.service.reader();

    producer
        .enqueue("citizen", "1", "citizens", json!({"nome": "Ana"}))
        .await
        .unwrap();

    // Visible before the durable write
    let (before, _) = reader.read("citizen", "1", "citizens").await.unwrap().unwrap();
    assert_eq!(before["nome"], "Ana");
    assert!(h.durable.documents("citizens").is_empty());

    h.service.worker(0).run_cycle().await;
    assert_eq!(h.durable.documents("citizens").len(), 1);

    // Cache expired, write buffer gone: durable answers and refills the cache
    h.buffer.delete("citizen:cache:1").await.unwrap();
    let (after, _) = reader.read("citizen", "1", "citizens").await.unwrap().unwrap();
    assert_eq!(after["nome"], "Ana");
    assert!(h.buffer.get("citizen:cache:1").await.unwrap().is_some());
}

#[tokio::test]
async fn happy_upsert_preserves_unrelated_fields() {
    let h = harness(ReconcilerConfig::default());
    let existing = json!({"nome": "Old", "email": "a@b.c"}).as_object().cloned().unwrap();
    h.durable.upsert("citizens", "cpf", "1", existing).await.unwrap();

    push(&h.buffer, &SyncJob::new("citizen", "1", "citizens", json!({"nome": "New"}))).await;
    h.service.worker(0).run_cycle().await;

    let doc = h.durable.find_one("citizens", "cpf", "1").await.unwrap().unwrap();
    assert_eq!(doc["nome"], "New");
    assert_eq!(doc["email"], "a@b.c");
    assert_eq!(h.durable.documents("citizens").len(), 1);
}

#[tokio::test]
async fn happy_budget_caps_jobs_per_cycle() {
    let h = harness(ReconcilerConfig::default());
    let queues = ["citizen", "phone_mapping", "user_config", "opt_in_history", "beta_group"];
    for queue in queues {
        push(&h.buffer, &SyncJob::new(queue, "1", "docs", json!({"queue": queue}))).await;
    }

    let report = h.service.worker(0).run_cycle().await;
    assert_eq!(report.processed(), 3);
    let untouched = [
        h.buffer.list_len("sync:queue:opt_in_history").await.unwrap(),
        h.buffer.list_len("sync:queue:beta_group").await.unwrap(),
    ];
    assert_eq!(untouched, [1, 1]);
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn failure_below_max_requeued_with_incremented_count() {
    let h = harness(ReconcilerConfig::default());
    h.durable.fail_with(StorageError::Backend("connection refused".into()));
    let job = citizen_job();
    push(&h.buffer, &job).await;

    let report = h.service.worker(0).run_cycle().await;
    assert_eq!(report.count("retry"), 1);
    assert_eq!(release_delayed(&h.buffer, "citizen").await, 1);

    let queued = h.buffer.list("sync:queue:citizen");
    assert_eq!(queued.len(), 1);
    let requeued = SyncJob::from_json(&queued[0]).unwrap();
    assert_eq!(requeued.id, job.id);
    assert_eq!(requeued.retry_count, 1);
    assert!(h.buffer.list("sync:dlq:citizen").is_empty());
}

#[tokio::test]
async fn failure_exhausted_job_dead_lettered_exactly_once() {
    let h = harness(ReconcilerConfig::default());
    h.durable.fail_with(StorageError::Backend("connection refused".into()));
    let job = citizen_job();
    push(&h.buffer, &job).await;

    let worker = h.service.worker(0);
    let mut outcomes = Vec::new();
    for _ in 0..5 {
        let report = worker.run_cycle().await;
        outcomes.extend(report.outcomes.into_iter().map(|(_, o)| o));
        release_delayed(&h.buffer, "citizen").await;
    }

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[2], JobOutcome::DeadLettered);

    let dlq = h.buffer.list("sync:dlq:citizen");
    assert_eq!(dlq.len(), 1);
    let entry = DeadLetterJob::from_json(&dlq[0]).unwrap();
    assert_eq!(entry.original_job.id, job.id);
    assert_eq!(entry.original_job.retry_count, 3);
    assert!(!entry.error.is_empty());

    assert_eq!(h.buffer.list_len("sync:queue:citizen").await.unwrap(), 0);
    assert_eq!(h.buffer.delayed_len("sync:delayed:citizen").await.unwrap(), 0);
    assert_eq!(h.service.metrics().sync_failures("citizen"), 3);
}

#[tokio::test]
async fn failure_transient_error_recovers_on_retry() {
    let h = harness(ReconcilerConfig::default());
    h.durable.fail_times(1, StorageError::Backend("timeout".into()));
    push(&h.buffer, &citizen_job()).await;

    let worker = h.service.worker(0);
    assert_eq!(worker.run_cycle().await.count("retry"), 1);
    release_delayed(&h.buffer, "citizen").await;
    assert_eq!(worker.run_cycle().await.count("synced"), 1);

    assert_eq!(h.durable.documents("citizens").len(), 1);
    assert!(h.buffer.list("sync:dlq:citizen").is_empty());
}

#[tokio::test]
async fn failure_duplicate_key_is_success() {
    let h = harness(ReconcilerConfig::default());
    h.durable.fail_with(StorageError::DuplicateKey("E11000 duplicate key error".into()));
    push(&h.buffer, &citizen_job()).await;

    let report = h.service.worker(0).run_cycle().await;
    assert_eq!(report.count("duplicate"), 1);
    assert_eq!(h.service.metrics().sync_failures("citizen"), 0);
    assert!(h.buffer.list("sync:dlq:citizen").is_empty());
    assert_eq!(h.buffer.delayed_len("sync:delayed:citizen").await.unwrap(), 0);
}

#[tokio::test]
async fn failure_malformed_payload_eventually_dead_lettered() {
    let h = harness(ReconcilerConfig::default());
    push(&h.buffer, &SyncJob::new("citizen", "1", "citizens", json!([1, 2, 3]))).await;

    let worker = h.service.worker(0);
    for _ in 0..3 {
        worker.run_cycle().await;
        release_delayed(&h.buffer, "citizen").await;
    }

    assert_eq!(h.buffer.list("sync:dlq:citizen").len(), 1);
    assert_eq!(h.durable.upsert_calls(), 0);
}

// =============================================================================
// Degraded mode
// =============================================================================

#[tokio::test]
async fn degraded_queue_depths_never_decrease() {
    let h = harness(ReconcilerConfig::default());
    for queue in ["citizen", "phone_mapping", "user_config"] {
        for i in 0..2 {
            push(&h.buffer, &SyncJob::new(queue, i.to_string(), "c", json!({}))).await;
        }
    }
    h.service.degraded_mode().activate("durable_store_down");

    let worker = h.service.worker(0);
    for _ in 0..10 {
        assert!(worker.run_cycle().await.skipped);
    }
    for queue in ["citizen", "phone_mapping", "user_config"] {
        assert_eq!(h.buffer.list_len(&format!("sync:queue:{}", queue)).await.unwrap(), 2);
    }
    assert_eq!(h.durable.upsert_calls(), 0);

    h.service.degraded_mode().deactivate();
    assert_eq!(worker.run_cycle().await.processed(), 3);
}

#[tokio::test]
async fn degraded_health_check_follows_durable_store() {
    let h = harness(ReconcilerConfig::default());
    let degraded = h.service.degraded_mode();

    h.durable.fail_with(StorageError::Backend("down".into()));
    degraded.check_conditions(h.durable.as_ref(), h.buffer.as_ref()).await;
    assert!(h.service.is_degraded());
    assert_eq!(h.service.metrics().snapshot()["degraded_mode_active"], 1.0);

    h.durable.clear_failure();
    degraded.check_conditions(h.durable.as_ref(), h.buffer.as_ref()).await;
    assert!(!h.service.is_degraded());
}

// =============================================================================
// Backoff and metrics
// =============================================================================

#[test]
fn backoff_bounds() {
    let backoff = RequeueBackoff::default();
    let first = backoff.delay_for(1);
    assert!(first >= Duration::from_secs(5) && first < Duration::from_secs(10));
    assert_eq!(backoff.delay_for(20), Duration::from_secs(60));
}

#[tokio::test]
async fn metrics_hit_ratio_from_reads() {
    let h = harness(ReconcilerConfig::default());
    let reader = h.service.reader();
    assert_eq!(h.service.metrics().cache_hit_ratio("citizen"), 0.0);

    h.buffer.set("citizen:cache:1", "{}", None).await.unwrap();
    for _ in 0..3 {
        reader.read("citizen", "1", "citizens").await.unwrap();
    }
    reader.read("citizen", "missing", "citizens").await.unwrap();

    assert_eq!(h.service.metrics().cache_hit_ratio("citizen"), 0.75);
    let snapshot = h.service.metrics().snapshot();
    assert_eq!(snapshot["cache_hits_total_citizen"], 3.0);
    assert_eq!(snapshot["cache_misses_total_citizen"], 1.0);
}
