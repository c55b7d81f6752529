// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delay before a failed job becomes eligible again.
//!
//! Linear in the retry count, capped: `min(retry_count * step, max)`.
//! With the defaults (5 s step, 60 s cap) the first retry waits 5 s and
//! anything from the 12th on waits 60 s.

use std::time::Duration;

use crate::config::ReconcilerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeueBackoff {
    pub step: Duration,
    pub max: Duration,
}

impl Default for RequeueBackoff {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(5),
            max: Duration::from_secs(60),
        }
    }
}

impl RequeueBackoff {
    #[must_use]
    pub fn from_config(config: &ReconcilerConfig) -> Self {
        Self {
            step: Duration::from_secs(config.backoff_step_secs),
            max: Duration::from_secs(config.backoff_max_secs),
        }
    }

    /// Wait before attempt number `retry_count + 1`.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.step.saturating_mul(retry_count).min(self.max)
    }

    /// Epoch millis at which a job failed `retry_count` times becomes ready.
    #[must_use]
    pub fn ready_at_ms(&self, now_ms: i64, retry_count: u32) -> i64 {
        let delay = i64::try_from(self.delay_for(retry_count).as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_add(delay)
    }
}
