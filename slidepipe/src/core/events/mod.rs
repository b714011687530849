//! Task Event Module
//!
//! Lifecycle and progress events published to external consumers.
//! Every event carries the task key and a UTC timestamp and serializes as
//! camelCase JSON tagged by `type`.

mod bus;

pub use bus::*;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{TaskId, TaskKey};

// =============================================================================
// Progress
// =============================================================================

/// Pipeline phase reported with progress
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Starting,
    Transforming,
    Tiling,
    ExtractingMetadata,
    Completed,
    Failed,
    Cancelled,
}

/// Progress update for one task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_key: TaskKey,
    pub phase: Phase,
    /// 0-100, monotonic within a phase
    pub percent: u8,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn new(task_key: impl Into<TaskKey>, phase: Phase, percent: u8) -> Self {
        Self {
            task_key: task_key.into(),
            phase,
            percent: percent.min(100),
            timestamp: Utc::now(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Lifecycle event published on the bus
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskEvent {
    /// A stable source file passed admission
    #[serde(rename_all = "camelCase")]
    Detected {
        task_key: TaskKey,
        source_path: PathBuf,
        timestamp: DateTime<Utc>,
    },
    /// The task entered the queue (first time or after a retry delay)
    #[serde(rename_all = "camelCase")]
    Queued {
        task_key: TaskKey,
        task_id: TaskId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// The task was bound to a worker slot
    #[serde(rename_all = "camelCase")]
    Started {
        task_key: TaskKey,
        task_id: TaskId,
        attempt: u32,
        slot: usize,
        timestamp: DateTime<Utc>,
    },
    Progress(ProgressEvent),
    /// An attempt failed and another one is scheduled
    #[serde(rename_all = "camelCase")]
    Retrying {
        task_key: TaskKey,
        failed_attempt: u32,
        retry_in_ms: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        task_key: TaskKey,
        output_path: PathBuf,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    /// Retries exhausted
    #[serde(rename_all = "camelCase")]
    Failed {
        task_key: TaskKey,
        error: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled {
        task_key: TaskKey,
        timestamp: DateTime<Utc>,
    },
}

impl TaskEvent {
    pub fn task_key(&self) -> &str {
        match self {
            TaskEvent::Detected { task_key, .. }
            | TaskEvent::Queued { task_key, .. }
            | TaskEvent::Started { task_key, .. }
            | TaskEvent::Retrying { task_key, .. }
            | TaskEvent::Completed { task_key, .. }
            | TaskEvent::Failed { task_key, .. }
            | TaskEvent::Cancelled { task_key, .. } => task_key,
            TaskEvent::Progress(progress) => &progress.task_key,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TaskEvent::Detected { timestamp, .. }
            | TaskEvent::Queued { timestamp, .. }
            | TaskEvent::Started { timestamp, .. }
            | TaskEvent::Retrying { timestamp, .. }
            | TaskEvent::Completed { timestamp, .. }
            | TaskEvent::Failed { timestamp, .. }
            | TaskEvent::Cancelled { timestamp, .. } => *timestamp,
            TaskEvent::Progress(progress) => progress.timestamp,
        }
    }

    /// Short name matching the serialized `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Detected { .. } => "detected",
            TaskEvent::Queued { .. } => "queued",
            TaskEvent::Started { .. } => "started",
            TaskEvent::Progress(_) => "progress",
            TaskEvent::Retrying { .. } => "retrying",
            TaskEvent::Completed { .. } => "completed",
            TaskEvent::Failed { .. } => "failed",
            TaskEvent::Cancelled { .. } => "cancelled",
        }
    }

    /// Exactly one terminal event is published per task.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::Completed { .. } | TaskEvent::Failed { .. } | TaskEvent::Cancelled { .. }
        )
    }

    pub fn cancelled(task_key: impl Into<TaskKey>) -> Self {
        TaskEvent::Cancelled {
            task_key: task_key.into(),
            timestamp: Utc::now(),
        }
    }
}
