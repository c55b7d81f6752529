// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dead-letter watchdog. Reports list sizes, never reprocesses.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::worker::Pipeline;
use crate::storage::traits::StorageError;
use crate::sync_job::{dead_letter_key, delayed_key, queue_key, DeadLetterJob};

/// Depths observed for one queue during a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub pending: u64,
    pub delayed: u64,
    pub dead_letter: u64,
    /// Error of the newest dead letter, when the list is non-empty
    pub latest_error: Option<String>,
}

pub struct DeadLetterWatchdog {
    pipeline: Arc<Pipeline>,
}

impl DeadLetterWatchdog {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.pipeline.config.dead_letter_scan_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = period.as_secs(), "Dead-letter watchdog started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Dead-letter watchdog stopped");
    }

    /// Sample every configured queue once.
    ///
    /// Depths go into the registry as `<queue>`, `delayed_<queue>` and
    /// `dlq_<queue>`. A queue whose lists cannot be read is left out.
    pub async fn scan(&self) -> Vec<(String, QueueDepths)> {
        let mut report = Vec::with_capacity(self.pipeline.config.queues.len());

        for queue in &self.pipeline.config.queues {
            match self.sample(queue).await {
                Ok(depths) => {
                    let metrics = &self.pipeline.metrics;
                    metrics.record_queue_depth(queue, depths.pending);
                    metrics.record_queue_depth(&format!("delayed_{}", queue), depths.delayed);
                    metrics.record_queue_depth(&format!("dlq_{}", queue), depths.dead_letter);

                    if depths.dead_letter > 0 {
                        warn!(
                            queue = %queue,
                            count = depths.dead_letter,
                            dlq = %dead_letter_key(queue),
                            latest_error = depths.latest_error.as_deref().unwrap_or("unknown"),
                            "Dead-letter queue has failed jobs"
                        );
                    }
                    report.push((queue.clone(), depths));
                }
                Err(e) => {
                    debug!(queue = %queue, error = %e, "Failed to sample queue depths");
                }
            }
        }
        report
    }

    async fn sample(&self, queue: &str) -> Result<QueueDepths, StorageError> {
        let buffer = &self.pipeline.buffer;
        let dead_letter = buffer.list_len(&dead_letter_key(queue)).await?;
        let latest_error = if dead_letter > 0 {
            self.latest_error(queue).await
        } else {
            None
        };

        Ok(QueueDepths {
            pending: buffer.list_len(&queue_key(queue)).await?,
            delayed: buffer.delayed_len(&delayed_key(queue)).await?,
            dead_letter,
            latest_error,
        })
    }

    /// Peek the head of the dead-letter list (newest entry).
    async fn latest_error(&self, queue: &str) -> Option<String> {
        let head = match self.pipeline.buffer.list_range(&dead_letter_key(queue), 1).await {
            Ok(head) => head,
            Err(e) => {
                debug!(queue = %queue, error = %e, "Failed to peek dead-letter queue");
                return None;
            }
        };
        head.first()
            .and_then(|raw| DeadLetterJob::from_json(raw).ok())
            .map(|entry| entry.error)
    }
}
