//! Conversion Pipeline Module
//!
//! Runs one conversion attempt for a task:
//! - Stage 1 (transform): source -> intermediate artifact in the work directory
//! - Stage 2 (tiling): intermediate -> pyramid under the output root
//! - Optional metadata extraction
//!
//! Progress is parsed from tool output, mapped onto overall percentages and
//! throttled before it reaches listeners. Cancellation and the runtime watchdog
//! terminate the live child gracefully, then forcibly.

mod artifact;
mod progress;
mod runner;

pub use artifact::IntermediateArtifact;
pub use progress::{map_to_range, parse_percent, ProgressReporter, ProgressSink};
pub use runner::ProcessPipeline;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::core::events::Phase;
use crate::core::settings::OutputSettings;
use crate::core::tasks::ConversionTask;
use crate::core::{TaskId, TaskKey};

// =============================================================================
// Stages
// =============================================================================

/// External command stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Transform,
    Tiling,
    Metadata,
}

impl Stage {
    /// Phase reported while the stage runs
    pub fn phase(self) -> Phase {
        match self {
            Stage::Transform => Phase::Transforming,
            Stage::Tiling => Phase::Tiling,
            Stage::Metadata => Phase::ExtractingMetadata,
        }
    }

    /// Slice of overall progress covered by the stage
    pub fn range(self) -> (u8, u8) {
        match self {
            Stage::Transform => (0, 50),
            Stage::Tiling => (50, 90),
            Stage::Metadata => (90, 100),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Transform => write!(f, "transform"),
            Stage::Tiling => write!(f, "tiling"),
            Stage::Metadata => write!(f, "metadata"),
        }
    }
}

// =============================================================================
// Request / Output
// =============================================================================

/// Everything a pipeline needs to convert one task
#[derive(Clone, Debug)]
pub struct ConversionRequest {
    pub task_id: TaskId,
    pub task_key: TaskKey,
    pub source_path: PathBuf,
    /// Base path (no extension) handed to the tile command
    pub output_base: PathBuf,
    /// Finished artifact, e.g. `<outputRoot>/<taskKey>.dzi`
    pub output_artifact: PathBuf,
    /// 1-based attempt number
    pub attempt: u32,
}

impl ConversionRequest {
    pub fn for_task(task: &ConversionTask, output: &OutputSettings) -> Self {
        Self {
            task_id: task.id.clone(),
            task_key: task.task_key.clone(),
            source_path: task.source_path.clone(),
            output_base: output.output_base(&task.task_key),
            output_artifact: output.output_artifact(&task.task_key),
            attempt: task.attempt(),
        }
    }
}

/// Successful conversion result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversionOutput {
    pub output_path: PathBuf,
}

// =============================================================================
// Errors
// =============================================================================

/// Failure of a single conversion attempt
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to start {stage} command `{program}`: {source}")]
    Spawn {
        stage: Stage,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} stage exited with {}: {stderr}", exit_code_label(.code))]
    StageFailed {
        stage: Stage,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Conversion exceeded the maximum runtime of {0:?}")]
    TimedOut(Duration),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Remote conversion failed: {0}")]
    Remote(String),

    #[error("Conversion task aborted: {0}")]
    Aborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

// =============================================================================
// Pipeline Trait
// =============================================================================

/// A conversion backend: local subprocesses or a remote service.
///
/// `cancel` resolves when the task is cancelled (or its owner went away); the
/// implementation must then stop its work, clean up, and return
/// [`PipelineError::Cancelled`].
#[async_trait]
pub trait ConversionPipeline: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    async fn run(
        &self,
        request: ConversionRequest,
        reporter: ProgressReporter,
        cancel: oneshot::Receiver<()>,
    ) -> Result<ConversionOutput, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_ranges_cover_pipeline() {
        assert_eq!(Stage::Transform.range(), (0, 50));
        assert_eq!(Stage::Tiling.range(), (50, 90));
        assert_eq!(Stage::Metadata.range(), (90, 100));
        assert_eq!(Stage::Tiling.phase(), Phase::Tiling);
    }

    #[test]
    fn test_stage_failed_display() {
        let err = PipelineError::StageFailed {
            stage: Stage::Transform,
            code: Some(3),
            stderr: "bad profile".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "transform stage exited with code 3: bad profile"
        );

        let err = PipelineError::StageFailed {
            stage: Stage::Tiling,
            code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("a signal"));
    }

    #[test]
    fn test_request_for_task() {
        let task = ConversionTask::new(std::path::Path::new("/in/a/b.svs"), "a__b".into());
        let output = OutputSettings {
            output_root: PathBuf::from("/out"),
            ..Default::default()
        };

        let request = ConversionRequest::for_task(&task, &output);
        assert_eq!(request.output_base, PathBuf::from("/out/a__b"));
        assert_eq!(request.output_artifact, PathBuf::from("/out/a__b.dzi"));
        assert_eq!(request.attempt, 1);
    }
}
