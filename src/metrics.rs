// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for the reconciliation pipeline.
//!
//! Two layers:
//! - [`MetricsRegistry`]: in-process counters and gauges, shared through an
//!   `Arc`, readable with [`MetricsRegistry::snapshot`]. This is what health
//!   endpoints and tests look at.
//! - Free functions emitting through the `metrics` crate facade, so the host
//!   process picks the exporter (Prometheus, OTEL, etc.). The registry calls
//!   them on every update.
//!
//! # Metric Naming Convention
//! - `sync_reconciler_` prefix for facade metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `job_type`: queue / job type name
//! - `cache`: cache namespace (usually the job type)
//! - `outcome`: synced, duplicate, retry, dead_letter

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};

/// Record a finished job attempt
pub fn record_job(job_type: &str, outcome: &str) {
    counter!(
        "sync_reconciler_jobs_total",
        "job_type" => job_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record durable upsert latency
pub fn record_upsert_latency(job_type: &str, duration: Duration) {
    histogram!(
        "sync_reconciler_upsert_seconds",
        "job_type" => job_type.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set the depth of a queue (or `dlq_*` / `delayed_*` list)
pub fn set_queue_depth(queue: &str, depth: u64) {
    gauge!(
        "sync_reconciler_queue_depth",
        "queue" => queue.to_string()
    )
    .set(depth as f64);
}

/// Record a cache lookup
pub fn record_cache_lookup(cache: &str, hit: bool) {
    counter!(
        "sync_reconciler_cache_lookups_total",
        "cache" => cache.to_string(),
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

pub fn set_degraded_mode(active: bool) {
    gauge!("sync_reconciler_degraded_mode").set(if active { 1.0 } else { 0.0 });
}

/// Record a degraded-mode activation and its reason
pub fn record_degraded_activation(reason: &str) {
    counter!(
        "sync_reconciler_degraded_activations_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record delayed jobs moved back to their queue
pub fn record_requeued(job_type: &str, count: u64) {
    counter!(
        "sync_reconciler_requeued_total",
        "job_type" => job_type.to_string()
    )
    .increment(count);
}

/// Record a job that could not be placed anywhere (logged in full)
pub fn record_lost_job(job_type: &str) {
    counter!(
        "sync_reconciler_lost_jobs_total",
        "job_type" => job_type.to_string()
    )
    .increment(1);
}

/// Record how long a worker cycle took
pub fn record_cycle(worker_id: usize, processed: usize, duration: Duration) {
    histogram!(
        "sync_reconciler_cycle_seconds",
        "worker" => worker_id.to_string()
    )
    .record(duration.as_secs_f64());
    histogram!("sync_reconciler_cycle_jobs").record(processed as f64);
}

pub fn set_service_state(state: &str) {
    // Gauge per state, 1 for the current one
    for s in ["created", "running", "stopping", "stopped"] {
        gauge!(
            "sync_reconciler_service_state",
            "state" => s
        )
        .set(if s == state { 1.0 } else { 0.0 });
    }
}

/// A timing guard that records upsert latency on drop
pub struct LatencyTimer {
    job_type: String,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(job_type: &str) -> Self {
        Self {
            job_type: job_type.to_string(),
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_upsert_latency(&self.job_type, self.start.elapsed());
    }
}

fn bump(map: &DashMap<String, AtomicU64>, key: &str) -> u64 {
    // Fast path avoids allocating the key once the entry exists
    if let Some(counter) = map.get(key) {
        return counter.fetch_add(1, Ordering::Relaxed) + 1;
    }
    map.entry(key.to_string())
        .or_default()
        .fetch_add(1, Ordering::Relaxed)
        + 1
}

fn read(map: &DashMap<String, AtomicU64>, key: &str) -> u64 {
    map.get(key).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Process-local pipeline metrics.
///
/// Every key has its own atomic, so updates for different queues or caches
/// never contend beyond the map shard lookup.
#[derive(Default)]
pub struct MetricsRegistry {
    queue_depth: DashMap<String, AtomicU64>,
    sync_operations: DashMap<String, AtomicU64>,
    sync_failures: DashMap<String, AtomicU64>,
    cache_hits: DashMap<String, AtomicU64>,
    cache_misses: DashMap<String, AtomicU64>,
    last_success_ms: DashMap<String, AtomicI64>,
    degraded: AtomicBool,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (not add to) the depth of a queue.
    pub fn record_queue_depth(&self, queue: &str, depth: u64) {
        set_queue_depth(queue, depth);
        if let Some(gauge) = self.queue_depth.get(queue) {
            gauge.store(depth, Ordering::Relaxed);
            return;
        }
        self.queue_depth
            .entry(queue.to_string())
            .or_default()
            .store(depth, Ordering::Relaxed);
    }

    /// Last recorded depth, `None` if never sampled.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> Option<u64> {
        self.queue_depth.get(queue).map(|g| g.load(Ordering::Relaxed))
    }

    /// Count a successful sync and stamp its time.
    pub fn record_sync_success(&self, job_type: &str) {
        bump(&self.sync_operations, job_type);
        let now = Utc::now().timestamp_millis();
        if let Some(ts) = self.last_success_ms.get(job_type) {
            ts.store(now, Ordering::Relaxed);
            return;
        }
        self.last_success_ms
            .entry(job_type.to_string())
            .or_default()
            .store(now, Ordering::Relaxed);
    }

    pub fn record_sync_failure(&self, job_type: &str) {
        bump(&self.sync_failures, job_type);
    }

    #[must_use]
    pub fn sync_successes(&self, job_type: &str) -> u64 {
        read(&self.sync_operations, job_type)
    }

    #[must_use]
    pub fn sync_failures(&self, job_type: &str) -> u64 {
        read(&self.sync_failures, job_type)
    }

    #[must_use]
    pub fn last_success(&self, job_type: &str) -> Option<DateTime<Utc>> {
        let ms = self.last_success_ms.get(job_type)?.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single()
    }

    pub fn record_cache_hit(&self, cache: &str) {
        bump(&self.cache_hits, cache);
        record_cache_lookup(cache, true);
    }

    pub fn record_cache_miss(&self, cache: &str) {
        bump(&self.cache_misses, cache);
        record_cache_lookup(cache, false);
    }

    /// `hits / (hits + misses)`, 0 when nothing was recorded.
    #[must_use]
    pub fn cache_hit_ratio(&self, cache: &str) -> f64 {
        ratio(read(&self.cache_hits, cache), read(&self.cache_misses, cache))
    }

    pub fn set_degraded(&self, active: bool) {
        self.degraded.store(active, Ordering::SeqCst);
        set_degraded_mode(active);
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Flat view of every metric.
    ///
    /// Keys: `sync_queue_depth_<queue>`, `sync_operations_total_<type>`,
    /// `sync_failures_total_<type>`, `sync_last_success_timestamp_<type>`
    /// (epoch seconds), `cache_hits_total_<cache>`, `cache_misses_total_<cache>`,
    /// `cache_hit_ratio_<cache>` and `degraded_mode_active` (0 or 1).
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();

        for entry in self.queue_depth.iter() {
            out.insert(
                format!("sync_queue_depth_{}", entry.key()),
                entry.value().load(Ordering::Relaxed) as f64,
            );
        }
        for entry in self.sync_operations.iter() {
            out.insert(
                format!("sync_operations_total_{}", entry.key()),
                entry.value().load(Ordering::Relaxed) as f64,
            );
        }
        for entry in self.sync_failures.iter() {
            out.insert(
                format!("sync_failures_total_{}", entry.key()),
                entry.value().load(Ordering::Relaxed) as f64,
            );
        }
        for entry in self.last_success_ms.iter() {
            out.insert(
                format!("sync_last_success_timestamp_{}", entry.key()),
                entry.value().load(Ordering::Relaxed) as f64 / 1000.0,
            );
        }

        let mut caches: Vec<String> = self.cache_hits.iter().map(|e| e.key().clone()).collect();
        caches.extend(self.cache_misses.iter().map(|e| e.key().clone()));
        caches.sort();
        caches.dedup();
        for cache in caches {
            let hits = read(&self.cache_hits, &cache);
            let misses = read(&self.cache_misses, &cache);
            out.insert(format!("cache_hits_total_{}", cache), hits as f64);
            out.insert(format!("cache_misses_total_{}", cache), misses as f64);
            out.insert(format!("cache_hit_ratio_{}", cache), ratio(hits, misses));
        }

        out.insert(
            "degraded_mode_active".to_string(),
            if self.is_degraded() { 1.0 } else { 0.0 },
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // Facade tests verify the API compiles and doesn't panic without a recorder.

    #[test]
    fn test_facade_functions() {
        record_job("citizen", "synced");
        record_job("citizen", "dead_letter");
        record_upsert_latency("citizen", Duration::from_millis(5));
        set_queue_depth("dlq_citizen", 3);
        record_cache_lookup("citizen", true);
        set_degraded_mode(true);
        record_degraded_activation("durable_store_down");
        record_requeued("citizen", 4);
        record_lost_job("citizen");
        record_cycle(0, 3, Duration::from_millis(2));
        set_service_state("running");
    }

    #[test]
    fn test_latency_timer() {
        let _timer = LatencyTimer::new("citizen");
    }

    #[test]
    fn test_queue_depth_is_set_not_added() {
        let metrics = MetricsRegistry::new();
        metrics.record_queue_depth("citizen", 10);
        metrics.record_queue_depth("citizen", 4);
        assert_eq!(metrics.queue_depth("citizen"), Some(4));
        assert_eq!(metrics.queue_depth("other"), None);
    }

    #[test]
    fn test_sync_counters() {
        let metrics = MetricsRegistry::new();
        assert!(metrics.last_success("citizen").is_none());

        metrics.record_sync_success("citizen");
        metrics.record_sync_success("citizen");
        metrics.record_sync_failure("citizen");

        assert_eq!(metrics.sync_successes("citizen"), 2);
        assert_eq!(metrics.sync_failures("citizen"), 1);
        assert_eq!(metrics.sync_failures("phone_mapping"), 0);
        assert!(metrics.last_success("citizen").is_some());
    }

    #[test]
    fn test_hit_ratio() {
        let metrics = MetricsRegistry::new();
        assert_eq!(metrics.cache_hit_ratio("citizen"), 0.0);

        for _ in 0..3 {
            metrics.record_cache_hit("citizen");
        }
        metrics.record_cache_miss("citizen");
        assert!((metrics.cache_hit_ratio("citizen") - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_keys() {
        let metrics = MetricsRegistry::new();
        metrics.record_queue_depth("dlq_citizen", 2);
        metrics.record_sync_success("citizen");
        metrics.record_cache_miss("citizen");
        metrics.set_degraded(true);

        let snap = metrics.snapshot();
        assert_eq!(snap["sync_queue_depth_dlq_citizen"], 2.0);
        assert_eq!(snap["sync_operations_total_citizen"], 1.0);
        assert_eq!(snap["cache_misses_total_citizen"], 1.0);
        assert_eq!(snap["cache_hit_ratio_citizen"], 0.0);
        assert_eq!(snap["degraded_mode_active"], 1.0);
        assert!(snap.contains_key("sync_last_success_timestamp_citizen"));
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_sync_success("citizen");
                        metrics.record_sync_failure(&format!("type_{}", i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.sync_successes("citizen"), 8000);
        assert_eq!(metrics.sync_failures("type_3"), 1000);
    }
}
