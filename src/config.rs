// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the reconciliation pipeline.
//!
//! # Example
//!
//! ```
//! use sync_reconciler::ReconcilerConfig;
//!
//! // Minimal config (uses defaults)
//! let config = ReconcilerConfig::default();
//! assert_eq!(config.worker_count, 10);
//! assert_eq!(config.max_jobs_per_cycle, 3);
//! assert_eq!(config.filter_field_for("citizens"), "cpf");
//! assert_eq!(config.filter_field_for("anything_else"), "_id");
//!
//! // Partial JSON: missing fields fall back to defaults
//! let config = ReconcilerConfig::from_json(r#"{"worker_count": 2, "tick_ms": 10}"#).unwrap();
//! assert_eq!(config.worker_count, 2);
//! assert_eq!(config.backoff_max_secs, 60);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Configuration for the reconciliation service.
///
/// Every field has a default, so a config file only needs the overrides.
/// Production use needs at least `redis_url` and `document_url`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Optional namespace prepended to every Redis key
    #[serde(default)]
    pub redis_prefix: Option<String>,

    /// Durable store: "mongodb://..." for Mongo, "sqlite:..."/"mysql://..." for SQL
    #[serde(default)]
    pub document_url: Option<String>,

    /// Mongo database name
    #[serde(default = "default_document_database")]
    pub document_database: String,

    /// Worker tasks (0 means the default)
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Worker cycle interval
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Jobs a worker processes per cycle, across all queues
    #[serde(default = "default_max_jobs_per_cycle")]
    pub max_jobs_per_cycle: usize,

    /// Job types to drain, in round-robin order
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Collection → natural-key field used as the upsert filter
    #[serde(default = "default_collection_keys")]
    pub collection_keys: HashMap<String, String>,

    /// Filter field for collections not in `collection_keys`
    #[serde(default = "default_filter_field")]
    pub default_filter_field: String,

    /// Upper bound on one durable upsert
    #[serde(default = "default_upsert_timeout_secs")]
    pub upsert_timeout_secs: u64,

    /// Retry backoff: `min(retry_count * step, max)`
    #[serde(default = "default_backoff_step_secs")]
    pub backoff_step_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Read-cache TTL written after a successful sync
    #[serde(default = "default_synced_cache_ttl_secs")]
    pub synced_cache_ttl_secs: u64,

    /// Read-cache TTL written by producers and by durable read-through
    #[serde(default = "default_read_cache_ttl_secs")]
    pub read_cache_ttl_secs: u64,

    /// Write-buffer TTL written by producers
    #[serde(default = "default_write_buffer_ttl_secs")]
    pub write_buffer_ttl_secs: u64,

    /// Retry budget stamped on jobs by the producer helper
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Health monitor
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_probe_timeout_ms")]
    pub health_probe_timeout_ms: u64,
    #[serde(default = "default_durable_latency_threshold_ms")]
    pub durable_latency_threshold_ms: u64,
    /// Fraction of Redis maxmemory that triggers degraded mode
    #[serde(default = "default_buffer_memory_threshold")]
    pub buffer_memory_threshold: f64,

    /// Dead-letter watchdog period
    #[serde(default = "default_dead_letter_scan_interval_secs")]
    pub dead_letter_scan_interval_secs: u64,

    /// Requeue scheduler
    #[serde(default = "default_requeue_interval_ms")]
    pub requeue_interval_ms: u64,
    #[serde(default = "default_requeue_batch_size")]
    pub requeue_batch_size: usize,

    /// Payload field consulted when dispatching special jobs
    #[serde(default = "default_discriminator_field")]
    pub discriminator_field: String,
}

fn default_document_database() -> String { "rmi".to_string() }
fn default_worker_count() -> usize { 10 }
fn default_tick_ms() -> u64 { 50 }
fn default_max_jobs_per_cycle() -> usize { 3 }
fn default_filter_field() -> String { "_id".to_string() }
fn default_upsert_timeout_secs() -> u64 { 30 }
fn default_backoff_step_secs() -> u64 { 5 }
fn default_backoff_max_secs() -> u64 { 60 }
fn default_synced_cache_ttl_secs() -> u64 { 3 * 60 * 60 } // 3 h
fn default_read_cache_ttl_secs() -> u64 { 60 * 60 } // 1 h
fn default_write_buffer_ttl_secs() -> u64 { 6 * 60 * 60 } // 6 h
fn default_max_retries() -> u32 { crate::sync_job::DEFAULT_MAX_RETRIES }
fn default_health_check_interval_secs() -> u64 { 10 }
fn default_health_probe_timeout_ms() -> u64 { 2_000 }
fn default_durable_latency_threshold_ms() -> u64 { 1_000 }
fn default_buffer_memory_threshold() -> f64 { 0.85 }
fn default_dead_letter_scan_interval_secs() -> u64 { 300 }
fn default_requeue_interval_ms() -> u64 { 250 }
fn default_requeue_batch_size() -> usize { 100 }
fn default_discriminator_field() -> String { "type".to_string() }

fn default_queues() -> Vec<String> {
    [
        "citizen",
        "phone_mapping",
        "user_config",
        "opt_in_history",
        "beta_group",
        "phone_verification",
        "maintenance_request",
        "self_declared_address",
        "self_declared_email",
        "self_declared_phone",
        "self_declared_raca",
        "self_declared_nome_exibicao",
        "cf_lookup",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_collection_keys() -> HashMap<String, String> {
    [
        ("citizens", "cpf"),
        ("self_declared", "cpf"),
        ("user_config", "cpf"),
        ("phone_cpf_mappings", "phone_number"),
        ("opt_in_histories", "cpf"),
        ("beta_groups", "cpf"),
        ("phone_verifications", "phone_number"),
        ("maintenance_requests", "cpf"),
    ]
    .into_iter()
    .map(|(c, f)| (c.to_string(), f.to_string()))
    .collect()
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_prefix: None,
            document_url: None,
            document_database: default_document_database(),
            worker_count: default_worker_count(),
            tick_ms: default_tick_ms(),
            max_jobs_per_cycle: default_max_jobs_per_cycle(),
            queues: default_queues(),
            collection_keys: default_collection_keys(),
            default_filter_field: default_filter_field(),
            upsert_timeout_secs: default_upsert_timeout_secs(),
            backoff_step_secs: default_backoff_step_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            synced_cache_ttl_secs: default_synced_cache_ttl_secs(),
            read_cache_ttl_secs: default_read_cache_ttl_secs(),
            write_buffer_ttl_secs: default_write_buffer_ttl_secs(),
            default_max_retries: default_max_retries(),
            health_check_interval_secs: default_health_check_interval_secs(),
            health_probe_timeout_ms: default_health_probe_timeout_ms(),
            durable_latency_threshold_ms: default_durable_latency_threshold_ms(),
            buffer_memory_threshold: default_buffer_memory_threshold(),
            dead_letter_scan_interval_secs: default_dead_letter_scan_interval_secs(),
            requeue_interval_ms: default_requeue_interval_ms(),
            requeue_batch_size: default_requeue_batch_size(),
            discriminator_field: default_discriminator_field(),
        }
    }
}

impl ReconcilerConfig {
    /// Parse a (possibly partial) JSON config.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Natural-key field used to match documents in `collection`.
    #[must_use]
    pub fn filter_field_for(&self, collection: &str) -> &str {
        self.collection_keys
            .get(collection)
            .map(String::as_str)
            .unwrap_or(&self.default_filter_field)
    }

    #[must_use]
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            default_worker_count()
        } else {
            self.worker_count
        }
    }

    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    #[must_use]
    pub fn upsert_timeout(&self) -> Duration {
        Duration::from_secs(self.upsert_timeout_secs)
    }

    #[must_use]
    pub fn synced_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.synced_cache_ttl_secs)
    }

    #[must_use]
    pub fn read_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.read_cache_ttl_secs)
    }

    #[must_use]
    pub fn write_buffer_ttl(&self) -> Duration {
        Duration::from_secs(self.write_buffer_ttl_secs)
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    #[must_use]
    pub fn dead_letter_scan_interval(&self) -> Duration {
        Duration::from_secs(self.dead_letter_scan_interval_secs.max(1))
    }

    #[must_use]
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_millis(self.requeue_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.tick_ms, 50);
        assert_eq!(config.upsert_timeout(), Duration::from_secs(30));
        assert_eq!(config.synced_cache_ttl(), Duration::from_secs(10_800));
        assert_eq!(config.write_buffer_ttl(), Duration::from_secs(21_600));
        assert_eq!(config.queues.len(), 13);
        assert_eq!(config.queues[0], "citizen");
        assert!((config.buffer_memory_threshold - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_json_matches_default() {
        let parsed = ReconcilerConfig::from_json("{}").unwrap();
        let default = ReconcilerConfig::default();
        assert_eq!(parsed.queues, default.queues);
        assert_eq!(parsed.collection_keys, default.collection_keys);
        assert_eq!(parsed.health_probe_timeout_ms, default.health_probe_timeout_ms);
    }

    #[test]
    fn test_filter_fields() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.filter_field_for("phone_cpf_mappings"), "phone_number");
        assert_eq!(config.filter_field_for("maintenance_requests"), "cpf");
        assert_eq!(config.filter_field_for("pets"), "_id");
    }

    #[test]
    fn test_zero_workers_falls_back() {
        let config = ReconcilerConfig { worker_count: 0, ..Default::default() };
        assert_eq!(config.effective_worker_count(), 10);
    }

    #[test]
    fn test_overridden_collection_keys_replace_defaults() {
        let config = ReconcilerConfig::from_json(r#"{"collection_keys": {"pets": "pet_id"}}"#).unwrap();
        assert_eq!(config.filter_field_for("pets"), "pet_id");
        assert_eq!(config.filter_field_for("citizens"), "_id");
    }
}
