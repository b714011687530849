//! Job System Module
//!
//! Runs admitted conversion tasks on a fixed number of worker slots.
//! A single coordination task owns the queue, the per-key records, the slots
//! and the admission store; everything else talks to it through a
//! [`WorkerPoolHandle`].

mod worker;

pub use worker::*;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::admission::SkipReason;
use crate::core::settings::Settings;
use crate::core::{TaskId, TaskKey};

// =============================================================================
// Worker Pool Configuration
// =============================================================================

/// Worker pool configuration
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// Number of worker slots
    pub max_concurrency: usize,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Delay before a failed task is re-queued
    pub retry_delay: Duration,
    /// Minimum spacing of progress events within a phase
    pub progress_interval: Duration,
    /// Terminal statuses kept for lookups
    pub history_limit: usize,
    /// Queue age that triggers a stale warning
    pub stale_after: Duration,
    /// Period of the stale check
    pub stale_check_interval: Duration,
}

impl WorkerPoolConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_concurrency: settings.workers.max_concurrency.max(1),
            max_retries: settings.workers.max_retries,
            retry_delay: settings.workers.retry_delay(),
            progress_interval: settings.workers.progress_interval(),
            history_limit: settings.workers.history_limit.max(1),
            stale_after: settings.workers.stale_after(),
            stale_check_interval: settings.workers.stale_check_interval(),
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

// =============================================================================
// Consumer Outcomes
// =============================================================================

/// Result of `submit(path)`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SubmitOutcome {
    /// A new task was created and queued
    #[serde(rename_all = "camelCase")]
    Queued { task_key: TaskKey, task_id: TaskId },
    /// The file is too fresh; it will be re-evaluated automatically
    #[serde(rename_all = "camelCase")]
    Deferred { task_key: TaskKey, retry_after_ms: u64 },
    /// Valid slide that is converted, in flight, or claimed elsewhere
    #[serde(rename_all = "camelCase")]
    Skipped { task_key: TaskKey, reason: SkipReason },
    /// The file disappeared before it could be admitted
    #[serde(rename_all = "camelCase")]
    Vanished { task_key: TaskKey },
    /// Not a supported slide
    Ignored,
}

impl SubmitOutcome {
    pub fn task_key(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Queued { task_key, .. }
            | SubmitOutcome::Deferred { task_key, .. }
            | SubmitOutcome::Skipped { task_key, .. }
            | SubmitOutcome::Vanished { task_key } => Some(task_key),
            SubmitOutcome::Ignored => None,
        }
    }
}

/// Result of `cancel(taskKey)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CancelOutcome {
    /// The task was removed, or its pipeline was told to stop
    Cancelled,
    /// Unknown or already terminal key
    NotFound,
    /// A cancel is already winding the running task down
    AlreadyCancelling,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.workers.max_concurrency = 3;
        settings.workers.max_retries = 4;
        settings.workers.retry_delay_ms = 250;

        let config = WorkerPoolConfig::from_settings(&settings);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_submit_outcome_serialization() {
        let outcome = SubmitOutcome::Skipped {
            task_key: "slideA".to_string(),
            reason: SkipReason::AlreadyConverted,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["taskKey"], "slideA");
        assert_eq!(json["reason"], "alreadyConverted");
        assert_eq!(outcome.task_key(), Some("slideA"));
        assert_eq!(SubmitOutcome::Ignored.task_key(), None);
    }
}
