//! Local subprocess pipeline.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    map_to_range, parse_percent, ConversionOutput, ConversionPipeline, ConversionRequest,
    IntermediateArtifact, PipelineError, ProgressReporter, Stage,
};
use crate::core::events::Phase;
use crate::core::process::{configure_tokio_command, terminate_gracefully};
use crate::core::settings::{Settings, ToolCommand, ToolSettings};

/// Stderr lines kept for failure reports
const STDERR_TAIL_LINES: usize = 20;

/// Upper bound on the captured stderr text
const STDERR_TAIL_BYTES: usize = 4096;

/// How long to wait for buffered output after the child exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs the transform and tile commands as child processes.
#[derive(Debug, Clone)]
pub struct ProcessPipeline {
    tools: ToolSettings,
    work_dir: PathBuf,
    intermediate_extension: String,
    threads: usize,
    termination_grace: Duration,
    max_runtime: Option<Duration>,
}

impl ProcessPipeline {
    pub fn new(settings: &Settings) -> Self {
        Self {
            tools: settings.tools.clone(),
            work_dir: settings.output.work_dir.clone(),
            intermediate_extension: settings.output.intermediate_extension.clone(),
            threads: settings.threads_per_pipeline(),
            termination_grace: settings.workers.termination_grace(),
            max_runtime: settings.workers.max_runtime(),
        }
    }

    /// Threads handed to each stage
    pub fn threads(&self) -> usize {
        self.threads
    }

    fn build_command(&self, tool: &ToolCommand, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&tool.program);
        cmd.args(tool.render_args(input, output, self.threads))
            .env(&self.tools.thread_env_var, self.threads.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_tokio_command(&mut cmd);
        cmd
    }

    /// Runs one stage to completion, forwarding mapped progress.
    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        stage: Stage,
        tool: &ToolCommand,
        input: &Path,
        output: &Path,
        reporter: &mut ProgressReporter,
        cancel: &mut oneshot::Receiver<()>,
        deadline: Option<Instant>,
    ) -> Result<(), PipelineError> {
        match cancel.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => {}
            _ => return Err(PipelineError::Cancelled),
        }

        let (start, end) = stage.range();
        reporter.report(stage.phase(), start, None);

        debug!(
            task_key = %reporter.task_key(),
            stage = %stage,
            program = %tool.program,
            "Starting stage"
        );

        let mut child = self
            .build_command(tool, input, output)
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                stage,
                program: tool.program.clone(),
                source,
            })?;

        let stderr_tail = child.stderr.take().map(collect_stderr_tail);
        let mut stdout = child.stdout.take().map(BufReader::new);
        let mut stdout_done = stdout.is_none();
        let mut segment = Vec::new();

        let status = loop {
            tokio::select! {
                read = next_segment(stdout.as_mut(), &mut segment), if !stdout_done => {
                    match read {
                        Ok(true) => {
                            let line = String::from_utf8_lossy(&segment);
                            if let Some(percent) = parse_percent(&line) {
                                reporter.report(stage.phase(), map_to_range(percent, start, end), None);
                            }
                        }
                        Ok(false) => stdout_done = true,
                        Err(e) => {
                            debug!(stage = %stage, error = %e, "Stopped reading stage output");
                            stdout_done = true;
                        }
                    }
                }
                status = child.wait() => break status?,
                _ = &mut *cancel => {
                    info!(task_key = %reporter.task_key(), stage = %stage, "Cancelling stage");
                    self.stop_child(&mut child).await;
                    return Err(PipelineError::Cancelled);
                }
                _ = watchdog(deadline) => {
                    let limit = self.max_runtime.unwrap_or_default();
                    warn!(
                        task_key = %reporter.task_key(),
                        stage = %stage,
                        limit_secs = limit.as_secs(),
                        "Conversion exceeded maximum runtime"
                    );
                    self.stop_child(&mut child).await;
                    return Err(PipelineError::TimedOut(limit));
                }
            }
        };

        // The exit can win the race against the last buffered progress lines.
        if !stdout_done {
            let drain = async {
                while let Ok(true) = next_segment(stdout.as_mut(), &mut segment).await {
                    if let Some(percent) = parse_percent(&String::from_utf8_lossy(&segment)) {
                        reporter.report(stage.phase(), map_to_range(percent, start, end), None);
                    }
                }
            };
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await;
        }

        if status.success() {
            return Ok(());
        }

        let stderr = match stderr_tail {
            Some(handle) => tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, handle)
                .await
                .ok()
                .and_then(|joined| joined.ok())
                .unwrap_or_default(),
            None => String::new(),
        };
        Err(PipelineError::StageFailed {
            stage,
            code: status.code(),
            stderr,
        })
    }

    async fn stop_child(&self, child: &mut Child) {
        if let Err(e) = terminate_gracefully(child, self.termination_grace).await {
            warn!(error = %e, "Failed to terminate stage process");
        }
    }

    async fn convert(
        &self,
        request: &ConversionRequest,
        reporter: &mut ProgressReporter,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<ConversionOutput, PipelineError> {
        reporter.report(Phase::Starting, 0, None);

        if !tokio::fs::try_exists(&request.source_path).await.unwrap_or(false) {
            return Err(PipelineError::InvalidInput(format!(
                "Source file does not exist: {}",
                request.source_path.display()
            )));
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        if let Some(parent) = request.output_base.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let deadline = self.max_runtime.map(|limit| Instant::now() + limit);
        let intermediate =
            IntermediateArtifact::new(&self.work_dir, &request.task_key, &self.intermediate_extension);

        self.run_stage(
            Stage::Transform,
            &self.tools.transform,
            &request.source_path,
            intermediate.path(),
            reporter,
            cancel,
            deadline,
        )
        .await?;

        self.run_stage(
            Stage::Tiling,
            &self.tools.tile,
            intermediate.path(),
            &request.output_base,
            reporter,
            cancel,
            deadline,
        )
        .await?;

        if let Err(e) = intermediate.remove().await {
            warn!(task_key = %request.task_key, error = %e, "Failed to remove intermediate artifact");
        }

        match &self.tools.metadata {
            Some(metadata) => {
                self.run_stage(
                    Stage::Metadata,
                    metadata,
                    &request.source_path,
                    &request.output_base,
                    reporter,
                    cancel,
                    deadline,
                )
                .await?;
            }
            None => {
                reporter.report(
                    Phase::ExtractingMetadata,
                    Stage::Metadata.range().0,
                    Some("metadata extraction not configured".to_string()),
                );
            }
        }

        if !tokio::fs::try_exists(&request.output_artifact).await.unwrap_or(false) {
            warn!(
                task_key = %request.task_key,
                artifact = %request.output_artifact.display(),
                "Tile command succeeded but the expected output artifact is missing"
            );
        }

        reporter.report(Phase::Completed, 100, None);
        Ok(ConversionOutput {
            output_path: request.output_artifact.clone(),
        })
    }
}

#[async_trait]
impl ConversionPipeline for ProcessPipeline {
    fn name(&self) -> &str {
        "local"
    }

    async fn run(
        &self,
        request: ConversionRequest,
        mut reporter: ProgressReporter,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<ConversionOutput, PipelineError> {
        let result = self.convert(&request, &mut reporter, &mut cancel).await;

        if result.is_err() {
            // A half-written artifact would later read as "already converted".
            match tokio::fs::remove_file(&request.output_artifact).await {
                Ok(()) => debug!(task_key = %request.task_key, "Removed partial output artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(task_key = %request.task_key, error = %e, "Failed to remove partial output"),
            }
        }

        result
    }
}

/// Resolves at the deadline, or never when there is none.
async fn watchdog(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Reads the next `\n`- or `\r`-terminated segment.
///
/// Imaging tools redraw progress with carriage returns, so both count as line
/// ends. Returns false at end of stream.
async fn next_segment<R: AsyncBufRead + Unpin>(
    reader: Option<&mut R>,
    segment: &mut Vec<u8>,
) -> std::io::Result<bool> {
    let Some(reader) = reader else {
        return Ok(false);
    };
    segment.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(!segment.is_empty());
        }
        if let Some(pos) = available.iter().position(|b| *b == b'\n' || *b == b'\r') {
            segment.extend_from_slice(&available[..pos]);
            reader.consume(pos + 1);
            return Ok(true);
        }
        let len = available.len();
        segment.extend_from_slice(available);
        reader.consume(len);
    }
}

/// Collects the last lines of stderr in the background.
fn collect_stderr_tail(stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        let mut text = tail.into_iter().collect::<Vec<_>>().join("\n");
        if text.len() > STDERR_TAIL_BYTES {
            let mut cut = text.len() - STDERR_TAIL_BYTES;
            while !text.is_char_boundary(cut) {
                cut += 1;
            }
            text = text.split_off(cut);
        }
        text
    })
}
