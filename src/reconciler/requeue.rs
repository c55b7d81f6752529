// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Moves parked jobs back onto their queue once their backoff has elapsed.
//!
//! Failed jobs wait in `sync:delayed:<queue>`, a sorted set scored by the
//! epoch-millisecond time they become ready. Each pass promotes at most
//! `requeue_batch_size` due members per queue.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::worker::Pipeline;
use crate::metrics::record_requeued;
use crate::sync_job::{delayed_key, queue_key};

pub struct RequeueScheduler {
    pipeline: Arc<Pipeline>,
}

impl RequeueScheduler {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.pipeline.config.requeue_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.pipeline.config.requeue_interval_ms,
            "Requeue scheduler started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.promote_due(Utc::now().timestamp_millis()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Requeue scheduler stopped");
    }

    /// Promote everything due at `now_ms`. Returns the number of jobs moved.
    pub async fn promote_due(&self, now_ms: i64) -> u64 {
        let batch = self.pipeline.config.requeue_batch_size;
        let mut total = 0;

        for queue in &self.pipeline.config.queues {
            match self
                .pipeline
                .buffer
                .promote_due(&delayed_key(queue), &queue_key(queue), now_ms, batch)
                .await
            {
                Ok(0) => {}
                Ok(moved) => {
                    debug!(queue = %queue, moved, "Requeued delayed jobs");
                    record_requeued(queue, moved);
                    total += moved;
                }
                Err(e) => {
                    // Members stay parked; the next pass picks them up
                    warn!(queue = %queue, error = %e, "Failed to requeue delayed jobs");
                }
            }
        }
        total
    }
}
