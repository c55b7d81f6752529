// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service lifecycle: start and stop.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{info, warn};

use super::requeue::RequeueScheduler;
use super::watchdog::DeadLetterWatchdog;
use super::worker::SyncWorker;
use super::{ReconciliationService, RunningTasks, ServiceState};

impl ReconciliationService {
    /// Start the pipeline.
    ///
    /// Startup order:
    /// 1. One health probe, so workers never start against a dead store
    /// 2. Health monitor loop
    /// 3. N workers
    /// 4. Dead-letter watchdog
    /// 5. Requeue scheduler
    ///
    /// Starting a running service is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            info!("Reconciliation service already running");
            return;
        }

        let p = &self.pipeline;
        info!(
            workers = p.config.effective_worker_count(),
            queues = p.config.queues.len(),
            "Starting reconciliation service"
        );

        // ========== PHASE 1: Health ==========
        if let Some(reason) = p.degraded.check_conditions(p.durable.as_ref(), p.buffer.as_ref()).await {
            warn!(reason, "Starting in degraded mode");
        }
        p.degraded
            .start_monitoring(Arc::clone(&p.durable), Arc::clone(&p.buffer));

        // ========== PHASE 2: Background tasks ==========
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        for id in 0..p.config.effective_worker_count() {
            let worker = SyncWorker::new(id, Arc::clone(p));
            handles.push(("worker", tokio::spawn(worker.run(shutdown_rx.clone()))));
        }

        let watchdog = DeadLetterWatchdog::new(Arc::clone(p));
        handles.push(("watchdog", tokio::spawn(watchdog.run(shutdown_rx.clone()))));

        let requeue = RequeueScheduler::new(Arc::clone(p));
        handles.push(("requeue", tokio::spawn(requeue.run(shutdown_rx))));

        *tasks = Some(RunningTasks {
            shutdown: shutdown_tx,
            handles,
        });
        self.set_state(ServiceState::Running);
        info!("Reconciliation service started");
    }

    /// Stop every task and wait for it to exit.
    ///
    /// In-flight jobs finish their current step. Stopping a service that
    /// is not running is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        let Some(running) = self.tasks.lock().await.take() else {
            return;
        };

        let started = Instant::now();
        info!(tasks = running.handles.len(), "Stopping reconciliation service");
        self.set_state(ServiceState::Stopping);

        self.pipeline.degraded.stop().await;

        let _ = running.shutdown.send(true);
        for (task, handle) in running.handles {
            if let Err(e) = handle.await {
                warn!(task, error = %e, "Task ended abnormally");
            }
        }

        self.set_state(ServiceState::Stopped);
        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            "Reconciliation service stopped"
        );
    }

    fn set_state(&self, state: ServiceState) {
        let _ = self.state.send(state);
        crate::metrics::set_service_state(state.as_str());
    }
}
