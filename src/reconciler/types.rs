// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the reconciliation service.

use std::time::Duration;

use thiserror::Error;

use crate::storage::traits::StorageError;

/// Service lifecycle state.
///
/// Observe it with [`super::ReconciliationService::state()`] or
/// [`super::ReconciliationService::state_receiver()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Built, tasks not spawned yet
    Created,
    /// Workers, health monitor, watchdog and requeue scheduler running
    Running,
    /// Stop requested, waiting for tasks to exit
    Stopping,
    /// All tasks exited
    Stopped,
}

impl ServiceState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Why a single job attempt failed. Every variant goes through the
/// retry/dead-letter path.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("upsert timed out after {0:?}")]
    Timeout(Duration),
    #[error("{handler} handler failed: {message}")]
    Handler { handler: String, message: String },
}

impl JobError {
    pub fn handler(handler: &str, message: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.to_string(),
            message: message.into(),
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage",
            Self::Malformed(_) => "malformed",
            Self::InvalidJob(_) => "invalid_job",
            Self::Timeout(_) => "timeout",
            Self::Handler { .. } => "handler",
        }
    }
}

/// What happened to one popped queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Written to the durable store
    Synced,
    /// Durable store reported a duplicate key; treated as synced
    Duplicate,
    /// A special handler completed it
    Handled { handler: String },
    /// Parked in the delayed set
    Retrying { retry_count: u32, delay: Duration },
    /// Pushed to the dead-letter list
    DeadLettered,
    /// Neither requeued nor dead-lettered; logged in full at error level
    Lost,
}

impl JobOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Duplicate => "duplicate",
            Self::Handled { .. } => "handled",
            Self::Retrying { .. } => "retry",
            Self::DeadLettered => "dead_letter",
            Self::Lost => "lost",
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Synced | Self::Duplicate | Self::Handled { .. })
    }
}

/// Summary of one worker cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// True when the cycle was skipped because degraded mode was active
    pub skipped: bool,
    /// `(queue, outcome)` for every popped entry, in processing order
    pub outcomes: Vec<(String, JobOutcome)>,
}

impl CycleReport {
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            outcomes: Vec::new(),
        }
    }

    /// Entries popped during the cycle.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn count(&self, label: &str) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.label() == label).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::Running.to_string(), "Running");
        assert_eq!(ServiceState::Stopped.as_str(), "stopped");
    }

    #[test]
    fn test_job_error_messages() {
        let err = JobError::handler("reference_cleanup", "missing avatar_id");
        assert_eq!(err.to_string(), "reference_cleanup handler failed: missing avatar_id");
        assert_eq!(err.kind(), "handler");

        let err: JobError = StorageError::Backend("down".into()).into();
        assert_eq!(err.kind(), "storage");
        assert!(err.to_string().contains("down"));
    }

    #[test]
    fn test_cycle_report_counts() {
        let report = CycleReport {
            skipped: false,
            outcomes: vec![
                ("a".into(), JobOutcome::Synced),
                ("b".into(), JobOutcome::Duplicate),
                ("a".into(), JobOutcome::DeadLettered),
            ],
        };
        assert_eq!(report.processed(), 3);
        assert_eq!(report.count("synced"), 1);
        assert_eq!(report.count("dead_letter"), 1);
        assert!(JobOutcome::Duplicate.is_success());
        assert!(!JobOutcome::Lost.is_success());
    }
}
