//! FIFO Task Queue
//!
//! Holds `Queued` tasks in arrival order. A key is present at most once.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::ConversionTask;
use crate::core::{CoreError, CoreResult, TaskKey};

/// Pending tasks in FIFO order
#[derive(Debug, Default)]
pub struct TaskQueue {
    pending: VecDeque<ConversionTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task, rejecting a key that is already queued.
    pub fn enqueue(&mut self, task: ConversionTask) -> CoreResult<()> {
        if self.contains(&task.task_key) {
            return Err(CoreError::DuplicateTask(task.task_key));
        }
        self.pending.push_back(task);
        Ok(())
    }

    /// Removes and returns the head when at least one slot is free.
    pub fn dequeue_next(&mut self, slack: usize) -> Option<ConversionTask> {
        if slack == 0 {
            return None;
        }
        self.pending.pop_front()
    }

    /// Removes a pending task by key.
    pub fn remove(&mut self, task_key: &str) -> Option<ConversionTask> {
        let index = self.pending.iter().position(|t| t.task_key == task_key)?;
        self.pending.remove(index)
    }

    pub fn contains(&self, task_key: &str) -> bool {
        self.pending.iter().any(|t| t.task_key == task_key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversionTask> {
        self.pending.iter()
    }

    /// Keys of tasks queued for longer than `threshold`.
    pub fn stale(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<TaskKey> {
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.pending
            .iter()
            .filter(|t| now.signed_duration_since(t.enqueued_at) > threshold)
            .map(|t| t.task_key.clone())
            .collect()
    }
}
