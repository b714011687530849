//! Conversion Task Module
//!
//! The unit of work tracked from admission to a terminal state, and the FIFO
//! holding area for tasks waiting on a free worker slot.

mod queue;

pub use queue::*;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::events::ProgressEvent;
use crate::core::{TaskId, TaskKey};

// =============================================================================
// Task Types
// =============================================================================

/// Task lifecycle state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    /// Waiting in queue (including a retry back-off)
    #[default]
    Queued,
    /// Bound to a worker slot
    Running,
    /// Output produced
    Completed,
    /// Retries exhausted
    Failed,
    /// Cancelled by a consumer or by removal of the source file
    Cancelled,
}

impl TaskState {
    /// Terminal states are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Conversion task definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionTask {
    /// Unique task ID, fresh for every admission
    pub id: TaskId,
    /// Absolute path of the source slide
    pub source_path: PathBuf,
    /// Original file name
    pub display_name: String,
    /// Dedup key and output base name
    pub task_key: TaskKey,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Time the task (or its latest retry) entered the queue
    pub enqueued_at: DateTime<Utc>,
    /// Current state
    pub state: TaskState,
    /// Error of the most recent failed attempt
    pub last_error: Option<String>,
}

impl ConversionTask {
    /// Creates a new queued task
    pub fn new(source_path: &Path, task_key: TaskKey) -> Self {
        let display_name = source_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| task_key.clone());

        Self {
            id: ulid::Ulid::new().to_string(),
            source_path: source_path.to_path_buf(),
            display_name,
            task_key,
            retry_count: 0,
            enqueued_at: Utc::now(),
            state: TaskState::Queued,
            last_error: None,
        }
    }

    /// Checks if task is running
    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }

    /// Checks if task reached a terminal state
    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }

    /// Attempt number of the next (or current) run, starting at 1
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}

/// Point-in-time view of a task returned to consumers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(flatten)]
    pub task: ConversionTask,
    /// Worker slot index while running
    pub slot: Option<usize>,
    /// Most recent progress event of the current attempt
    pub last_progress: Option<ProgressEvent>,
    /// Time the task re-enters the queue while backing off
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    pub fn state(&self) -> TaskState {
        self.task.state
    }
}
