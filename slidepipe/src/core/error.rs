//! slidepipe Error Definitions
//!
//! Defines error types used throughout the orchestration core.

use thiserror::Error;

use super::TaskKey;

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Admission Errors
    // =========================================================================
    #[error("Task already queued: {0}")]
    DuplicateTask(TaskKey),

    // =========================================================================
    // Watcher Errors
    // =========================================================================
    #[error("Watch root not found: {0}")]
    WatchRootMissing(String),

    #[error("File watcher error: {0}")]
    WatcherFailed(String),

    // =========================================================================
    // Pool Errors
    // =========================================================================
    #[error("Worker pool is shut down")]
    PoolClosed,

    // =========================================================================
    // Remote Errors
    // =========================================================================
    #[error("Remote request failed: {0}")]
    RemoteRequestFailed(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core engine result type
pub type CoreResult<T> = Result<T, CoreError>;
