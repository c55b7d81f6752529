// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Degraded mode: the pipeline-wide "stop writing" switch.
//!
//! A monitor task probes both stores every `interval`. Any failing probe
//! activates degraded mode with a reason; a fully passing round clears it.
//! Workers read [`DegradedMode::is_active`] before each cycle and skip the
//! cycle entirely while it is set.
//!
//! ```text
//!            probe fails / too slow / memory high
//!   Normal ─────────────────────────────────────▶ Degraded(reason)
//!     ▲                                               │
//!     └───────────────── all probes pass ─────────────┘
//! ```
//!
//! There is no hysteresis: one passing round is enough to resume.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ReconcilerConfig;
use crate::metrics::{record_degraded_activation, MetricsRegistry};
use crate::storage::traits::{BufferStore, DocumentStore};

pub const DURABLE_STORE_DOWN: &str = "durable_store_down";
pub const DURABLE_STORE_SLOW: &str = "durable_store_slow";
pub const BUFFER_STORE_DOWN: &str = "buffer_store_down";
pub const BUFFER_MEMORY_HIGH: &str = "buffer_memory_high";

/// Probe thresholds and cadence.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    /// Upper bound on each ping
    pub probe_timeout: Duration,
    /// A durable ping slower than this counts as unhealthy
    pub latency_threshold: Duration,
    /// Fraction of buffer maxmemory considered unhealthy
    pub memory_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from_config(&ReconcilerConfig::default())
    }
}

impl HealthConfig {
    #[must_use]
    pub fn from_config(config: &ReconcilerConfig) -> Self {
        Self {
            interval: config.health_check_interval(),
            probe_timeout: Duration::from_millis(config.health_probe_timeout_ms),
            latency_threshold: Duration::from_millis(config.durable_latency_threshold_ms),
            memory_threshold: config.buffer_memory_threshold,
        }
    }
}

#[derive(Default)]
struct Activation {
    reason: Option<String>,
    since: Option<Instant>,
}

/// Run every probe once and return the first failure reason, if any.
pub async fn probe_stores(
    durable: &dyn DocumentStore,
    buffer: &dyn BufferStore,
    config: &HealthConfig,
) -> Option<&'static str> {
    let started = Instant::now();
    match timeout(config.probe_timeout, durable.ping()).await {
        Ok(Ok(())) => {
            let latency = started.elapsed();
            if latency > config.latency_threshold {
                debug!(latency_ms = latency.as_millis() as u64, "Durable store ping slow");
                return Some(DURABLE_STORE_SLOW);
            }
        }
        Ok(Err(e)) => {
            debug!(error = %e, "Durable store ping failed");
            return Some(DURABLE_STORE_DOWN);
        }
        Err(_) => {
            debug!(timeout_ms = config.probe_timeout.as_millis() as u64, "Durable store ping timed out");
            return Some(DURABLE_STORE_DOWN);
        }
    }

    match timeout(config.probe_timeout, buffer.ping()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(error = %e, "Buffer store ping failed");
            return Some(BUFFER_STORE_DOWN);
        }
        Err(_) => return Some(BUFFER_STORE_DOWN),
    }

    match timeout(config.probe_timeout, buffer.memory_usage()).await {
        Ok(Ok(Some(usage))) => {
            if usage.ratio().is_some_and(|r| r >= config.memory_threshold) {
                return Some(BUFFER_MEMORY_HIGH);
            }
        }
        Ok(Ok(None)) => {}
        // Memory probe errors never degrade
        Ok(Err(e)) => debug!(error = %e, "Buffer memory probe failed"),
        Err(_) => debug!("Buffer memory probe timed out"),
    }

    None
}

pub struct DegradedMode {
    active: AtomicBool,
    activation: RwLock<Activation>,
    metrics: Arc<MetricsRegistry>,
    config: HealthConfig,
    monitor: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl DegradedMode {
    #[must_use]
    pub fn new(config: HealthConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            active: AtomicBool::new(false),
            activation: RwLock::new(Activation::default()),
            metrics,
            config,
            monitor: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Why degraded mode is on, `None` when it is off.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.activation.read().reason.clone()
    }

    /// How long degraded mode has been on.
    #[must_use]
    pub fn active_for(&self) -> Option<Duration> {
        self.activation.read().since.map(|s| s.elapsed())
    }

    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Turn degraded mode on.
    ///
    /// Idempotent: while already active, the first reason and activation
    /// time are kept.
    pub fn activate(&self, reason: &str) {
        {
            let mut activation = self.activation.write();
            if activation.reason.is_some() {
                return;
            }
            activation.reason = Some(reason.to_string());
            activation.since = Some(Instant::now());
            self.active.store(true, Ordering::Release);
        }

        self.metrics.set_degraded(true);
        record_degraded_activation(reason);
        warn!(reason, "Degraded mode activated, durable writes suspended");
    }

    /// Turn degraded mode off. No-op when already off.
    pub fn deactivate(&self) {
        let since = {
            let mut activation = self.activation.write();
            if activation.reason.is_none() {
                return;
            }
            activation.reason = None;
            self.active.store(false, Ordering::Release);
            activation.since.take()
        };

        self.metrics.set_degraded(false);
        let duration_ms = since.map(|s| s.elapsed().as_millis() as u64).unwrap_or(0);
        info!(duration_ms, "Degraded mode deactivated, durable writes resumed");
    }

    /// Probe both stores once and update the state.
    ///
    /// Returns the failure reason, or `None` when everything passed.
    pub async fn check_conditions(
        &self,
        durable: &dyn DocumentStore,
        buffer: &dyn BufferStore,
    ) -> Option<&'static str> {
        let reason = probe_stores(durable, buffer, &self.config).await;
        match reason {
            Some(reason) => self.activate(reason),
            None => self.deactivate(),
        }
        reason
    }

    /// Spawn the periodic monitor. A second call while running is a no-op.
    pub fn start_monitoring(
        self: &Arc<Self>,
        durable: Arc<dyn DocumentStore>,
        buffer: Arc<dyn BufferStore>,
    ) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.interval);
            info!(interval_ms = this.config.interval.as_millis() as u64, "Health monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.check_conditions(durable.as_ref(), buffer.as_ref()).await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            info!("Health monitor stopped");
        });

        *monitor = Some((shutdown_tx, handle));
    }

    /// Stop the monitor and wait for it to exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        let running = self.monitor.lock().take();
        if let Some((shutdown_tx, handle)) = running {
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
        }
    }

    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }
}
