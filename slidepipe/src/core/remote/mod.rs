//! Remote Delegation Module
//!
//! Forwards conversions to a remote conversion service instead of running the
//! tools locally. The client follows an async submit + poll pattern:
//! - `POST {base}/conversions` submits the task and returns a job id
//! - `GET {base}/conversions/{id}` is polled every `pollInterval`
//! - `DELETE {base}/conversions/{id}` forwards cancellation (best effort)

#[cfg(feature = "remote")]
mod http;

#[cfg(feature = "remote")]
pub use http::HttpTransport;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::core::events::Phase;
use crate::core::pipeline::{
    ConversionOutput, ConversionPipeline, ConversionRequest, PipelineError, ProgressReporter, Stage,
};
use crate::core::settings::RemoteSettings;
use crate::core::{CoreError, CoreResult, TaskId, TaskKey};

// =============================================================================
// Wire Types
// =============================================================================

/// Body of a submit request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSubmission {
    pub task_id: TaskId,
    pub task_key: TaskKey,
    pub source_path: String,
    pub output_base: String,
    pub output_artifact: String,
    pub attempt: u32,
    /// Host that submitted the conversion
    pub submitted_by: String,
}

impl RemoteSubmission {
    pub fn from_request(request: &ConversionRequest, submitted_by: &str) -> Self {
        Self {
            task_id: request.task_id.clone(),
            task_key: request.task_key.clone(),
            source_path: request.source_path.to_string_lossy().to_string(),
            output_base: request.output_base.to_string_lossy().to_string(),
            output_artifact: request.output_artifact.to_string_lossy().to_string(),
            attempt: request.attempt,
            submitted_by: submitted_by.to_string(),
        }
    }
}

/// Poll response as returned by the remote service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteJobStatus {
    pub status: String,
    #[serde(default)]
    pub phase: Option<String>,
    /// Overall percent, 0-100
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output_path: Option<String>,
}

impl RemoteJobStatus {
    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }
}

/// Remote state translated into local terms
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteState {
    Queued,
    Running {
        phase: Phase,
        percent: u8,
        message: Option<String>,
    },
    Completed {
        output_path: Option<PathBuf>,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

impl RemoteState {
    pub fn from_status(status: RemoteJobStatus) -> CoreResult<Self> {
        match status.status.to_ascii_lowercase().as_str() {
            "queued" | "pending" => Ok(RemoteState::Queued),
            "running" | "processing" => {
                let percent = status.progress.map(|p| p.clamp(0.0, 100.0).round() as u8);
                let phase = status
                    .phase
                    .as_deref()
                    .and_then(parse_phase)
                    .unwrap_or_else(|| phase_for_percent(percent.unwrap_or(0)));
                let percent = percent.unwrap_or_else(|| phase_start(phase));
                Ok(RemoteState::Running {
                    phase,
                    percent,
                    message: status.message,
                })
            }
            "completed" | "succeeded" => Ok(RemoteState::Completed {
                output_path: status.output_path.map(PathBuf::from),
            }),
            "failed" | "error" => Ok(RemoteState::Failed {
                error: status
                    .error
                    .or(status.message)
                    .unwrap_or_else(|| "Unknown error".to_string()),
            }),
            "cancelled" | "canceled" => Ok(RemoteState::Cancelled),
            other => Err(CoreError::RemoteRequestFailed(format!(
                "Unknown remote status '{}'",
                other
            ))),
        }
    }
}

fn parse_phase(value: &str) -> Option<Phase> {
    match value.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
        "starting" => Some(Phase::Starting),
        "transforming" | "transform" => Some(Phase::Transforming),
        "tiling" | "tile" => Some(Phase::Tiling),
        "extractingmetadata" | "metadata" => Some(Phase::ExtractingMetadata),
        _ => None,
    }
}

fn phase_for_percent(percent: u8) -> Phase {
    if percent < Stage::Tiling.range().0 {
        Phase::Transforming
    } else if percent < Stage::Metadata.range().0 {
        Phase::Tiling
    } else {
        Phase::ExtractingMetadata
    }
}

fn phase_start(phase: Phase) -> u8 {
    match phase {
        Phase::Transforming => Stage::Transform.range().0,
        Phase::Tiling => Stage::Tiling.range().0,
        Phase::ExtractingMetadata => Stage::Metadata.range().0,
        _ => 0,
    }
}

// =============================================================================
// Transport
// =============================================================================

/// The three calls the client needs from a remote service
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Submits a conversion and returns the remote job id
    async fn submit(&self, submission: &RemoteSubmission) -> CoreResult<String>;

    async fn poll(&self, job_id: &str) -> CoreResult<RemoteJobStatus>;

    async fn cancel(&self, job_id: &str) -> CoreResult<()>;
}

// =============================================================================
// Delegation Client
// =============================================================================

/// Conversion pipeline backed by a remote service
pub struct RemoteDelegationClient<T: RemoteTransport> {
    transport: T,
    poll_interval: Duration,
    max_poll_failures: u32,
    submitted_by: String,
}

impl<T: RemoteTransport> RemoteDelegationClient<T> {
    pub fn new(transport: T, settings: &RemoteSettings) -> Self {
        let submitted_by = hostname::get()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            transport,
            poll_interval: settings.poll_interval(),
            max_poll_failures: settings.max_poll_failures,
            submitted_by,
        }
    }

    pub fn with_submitter(mut self, submitted_by: impl Into<String>) -> Self {
        self.submitted_by = submitted_by.into();
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn cancel_remote(&self, task_key: &str, job_id: &str) {
        match self.transport.cancel(job_id).await {
            Ok(()) => info!(task_key = %task_key, job_id = %job_id, "Remote conversion cancelled"),
            Err(e) => warn!(
                task_key = %task_key,
                job_id = %job_id,
                error = %e,
                "Failed to cancel remote conversion"
            ),
        }
    }
}

#[async_trait]
impl<T: RemoteTransport> ConversionPipeline for RemoteDelegationClient<T> {
    fn name(&self) -> &str {
        "remote"
    }

    async fn run(
        &self,
        request: ConversionRequest,
        mut reporter: ProgressReporter,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<ConversionOutput, PipelineError> {
        let task_key = request.task_key.clone();
        reporter.report(Phase::Starting, 0, None);

        let submission = RemoteSubmission::from_request(&request, &self.submitted_by);
        let submit = self.transport.submit(&submission);
        tokio::pin!(submit);
        let job_id = tokio::select! {
            result = &mut submit => {
                result.map_err(|e| PipelineError::Remote(e.to_string()))?
            }
            _ = &mut cancel => {
                // The service may already have accepted the job; withdraw it once the id arrives.
                if let Ok(job_id) = submit.await {
                    self.cancel_remote(&task_key, &job_id).await;
                }
                return Err(PipelineError::Cancelled);
            }
        };
        info!(task_key = %task_key, job_id = %job_id, "Conversion submitted to remote service");

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval.max(Duration::from_millis(1)),
        );
        let mut consecutive_failures = 0u32;

        loop {
            let polled = tokio::select! {
                _ = &mut cancel => {
                    self.cancel_remote(&task_key, &job_id).await;
                    return Err(PipelineError::Cancelled);
                }
                polled = async {
                    ticker.tick().await;
                    self.transport.poll(&job_id).await
                } => polled,
            };

            let state = match polled.and_then(RemoteState::from_status) {
                Ok(state) => {
                    consecutive_failures = 0;
                    state
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        task_key = %task_key,
                        job_id = %job_id,
                        failures = consecutive_failures,
                        error = %e,
                        "Remote poll failed"
                    );
                    if consecutive_failures > self.max_poll_failures {
                        return Err(PipelineError::Remote(format!(
                            "Lost contact with remote service after {} failed polls: {}",
                            consecutive_failures, e
                        )));
                    }
                    continue;
                }
            };

            debug!(task_key = %task_key, job_id = %job_id, ?state, "Remote poll");
            match state {
                RemoteState::Queued => {}
                RemoteState::Running {
                    phase,
                    percent,
                    message,
                } => {
                    reporter.report(phase, percent, message);
                }
                RemoteState::Completed { output_path } => {
                    reporter.report(Phase::Completed, 100, None);
                    return Ok(ConversionOutput {
                        output_path: output_path.unwrap_or(request.output_artifact),
                    });
                }
                RemoteState::Failed { error } => return Err(PipelineError::Remote(error)),
                RemoteState::Cancelled => return Err(PipelineError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::ProgressEvent;
    use crate::core::tasks::ConversionTask;
    use crate::core::settings::OutputSettings;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    // =========================================================================
    // Scripted transport
    // =========================================================================

    #[derive(Default)]
    struct ScriptedTransport {
        submit_error: Option<String>,
        submit_delay: Duration,
        polls: Mutex<VecDeque<CoreResult<RemoteJobStatus>>>,
        submissions: Mutex<Vec<RemoteSubmission>>,
        poll_count: AtomicU32,
        cancels: AtomicU32,
        cancelled_jobs: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn scripted(polls: Vec<CoreResult<RemoteJobStatus>>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RemoteTransport for ScriptedTransport {
        async fn submit(&self, submission: &RemoteSubmission) -> CoreResult<String> {
            tokio::time::sleep(self.submit_delay).await;
            if let Some(error) = &self.submit_error {
                return Err(CoreError::RemoteRequestFailed(error.clone()));
            }
            self.submissions.lock().unwrap().push(submission.clone());
            Ok("job-1".to_string())
        }

        async fn poll(&self, job_id: &str) -> CoreResult<RemoteJobStatus> {
            assert_eq!(job_id, "job-1");
            self.poll_count.fetch_add(1, Ordering::SeqCst);
            // An exhausted script keeps reporting "running".
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(RemoteJobStatus::with_status("running")))
        }

        async fn cancel(&self, job_id: &str) -> CoreResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.cancelled_jobs.lock().unwrap().push(job_id.to_string());
            Ok(())
        }
    }

    fn running(phase: &str, progress: f32) -> CoreResult<RemoteJobStatus> {
        Ok(RemoteJobStatus {
            status: "processing".to_string(),
            phase: Some(phase.to_string()),
            progress: Some(progress),
            ..Default::default()
        })
    }

    fn settings(max_poll_failures: u32) -> RemoteSettings {
        RemoteSettings {
            enabled: true,
            base_url: Some("http://converter".to_string()),
            poll_interval_ms: 5,
            max_poll_failures,
            ..Default::default()
        }
    }

    fn request() -> ConversionRequest {
        let task = ConversionTask::new(Path::new("/in/slideA.svs"), "slideA".into());
        let output = OutputSettings {
            output_root: PathBuf::from("/out"),
            ..Default::default()
        };
        ConversionRequest::for_task(&task, &output)
    }

    fn recording_reporter() -> (ProgressReporter, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let reporter = ProgressReporter::new(
            "slideA",
            Duration::ZERO,
            Arc::new(move |event| sink_events.lock().unwrap().push(event)),
        );
        (reporter, events)
    }

    // =========================================================================
    // Tests
    // =========================================================================

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RemoteState::from_status(RemoteJobStatus::with_status("pending")).unwrap(),
            RemoteState::Queued
        );
        assert_eq!(
            RemoteState::from_status(RemoteJobStatus::with_status("CANCELED")).unwrap(),
            RemoteState::Cancelled
        );
        assert_eq!(
            RemoteState::from_status(running("tiling", 62.4).unwrap()).unwrap(),
            RemoteState::Running {
                phase: Phase::Tiling,
                percent: 62,
                message: None
            }
        );
        assert!(RemoteState::from_status(RemoteJobStatus::with_status("exploded")).is_err());
    }

    #[test]
    fn test_running_without_phase_or_percent() {
        let mut status = RemoteJobStatus::with_status("running");
        status.progress = Some(93.0);
        assert!(matches!(
            RemoteState::from_status(status).unwrap(),
            RemoteState::Running { phase: Phase::ExtractingMetadata, percent: 93, .. }
        ));

        let mut status = RemoteJobStatus::with_status("running");
        status.phase = Some("extracting_metadata".to_string());
        assert!(matches!(
            RemoteState::from_status(status).unwrap(),
            RemoteState::Running { phase: Phase::ExtractingMetadata, percent: 90, .. }
        ));

        assert!(matches!(
            RemoteState::from_status(RemoteJobStatus::with_status("running")).unwrap(),
            RemoteState::Running { phase: Phase::Transforming, percent: 0, .. }
        ));
    }

    #[test]
    fn test_failed_status_prefers_error_text() {
        let mut status = RemoteJobStatus::with_status("error");
        status.message = Some("generic".to_string());
        status.error = Some("disk full".to_string());
        assert_eq!(
            RemoteState::from_status(status).unwrap(),
            RemoteState::Failed {
                error: "disk full".to_string()
            }
        );
    }

    #[test]
    fn test_status_deserializes_camel_case() {
        let status: RemoteJobStatus = serde_json::from_str(
            r#"{"status":"completed","outputPath":"/out/slideA.dzi"}"#,
        )
        .unwrap();
        assert_eq!(status.output_path.as_deref(), Some("/out/slideA.dzi"));
        assert!(status.progress.is_none());
    }

    #[tokio::test]
    async fn test_completed_conversion_reports_progress() {
        let transport = ScriptedTransport::scripted(vec![
            Ok(RemoteJobStatus::with_status("queued")),
            running("transforming", 30.0),
            running("tiling", 70.0),
            Ok(RemoteJobStatus::with_status("succeeded")),
        ]);
        let client = RemoteDelegationClient::new(transport, &settings(3)).with_submitter("scanner-01");
        let (reporter, events) = recording_reporter();
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let output = client.run(request(), reporter, cancel_rx).await.unwrap();
        assert_eq!(output.output_path, PathBuf::from("/out/slideA.dzi"));

        let phases: Vec<(Phase, u8)> = events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.phase, e.percent))
            .collect();
        assert_eq!(
            phases,
            vec![
                (Phase::Starting, 0),
                (Phase::Transforming, 30),
                (Phase::Tiling, 70),
                (Phase::Completed, 100)
            ]
        );

        let submissions = client.transport().submissions.lock().unwrap();
        assert_eq!(submissions[0].task_key, "slideA");
        assert_eq!(submissions[0].submitted_by, "scanner-01");
        assert_eq!(submissions[0].output_artifact, "/out/slideA.dzi");
    }

    #[tokio::test]
    async fn test_remote_failure_is_returned() {
        let mut failed = RemoteJobStatus::with_status("failed");
        failed.error = Some("unsupported vendor format".to_string());
        let transport = ScriptedTransport::scripted(vec![Ok(failed)]);
        let client = RemoteDelegationClient::new(transport, &settings(3));
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let err = client
            .run(request(), ProgressReporter::noop("slideA"), cancel_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Remote(ref msg) if msg == "unsupported vendor format"));
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_submission() {
        let transport = ScriptedTransport {
            submit_error: Some("connection refused".to_string()),
            ..Default::default()
        };
        let client = RemoteDelegationClient::new(transport, &settings(3));
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let err = client
            .run(request(), ProgressReporter::noop("slideA"), cancel_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Remote(ref msg) if msg.contains("connection refused")));
        assert_eq!(client.transport().poll_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_poll_failures_are_tolerated() {
        let transport = ScriptedTransport::scripted(vec![
            Err(CoreError::RemoteRequestFailed("timeout".to_string())),
            Err(CoreError::RemoteRequestFailed("timeout".to_string())),
            Ok(RemoteJobStatus::with_status("completed")),
        ]);
        let client = RemoteDelegationClient::new(transport, &settings(2));
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let result = client
            .run(request(), ProgressReporter::noop("slideA"), cancel_rx)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_too_many_poll_failures_fail_attempt() {
        let failures = (0..4)
            .map(|_| Err(CoreError::RemoteRequestFailed("timeout".to_string())))
            .collect();
        let transport = ScriptedTransport::scripted(failures);
        let client = RemoteDelegationClient::new(transport, &settings(2));
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let err = client
            .run(request(), ProgressReporter::noop("slideA"), cancel_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Remote(ref msg) if msg.contains("3 failed polls")));
        assert_eq!(client.transport().poll_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_is_forwarded() {
        let client = RemoteDelegationClient::new(ScriptedTransport::default(), &settings(3));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let run = client.run(request(), ProgressReporter::noop("slideA"), cancel_rx);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_tx.send(()).unwrap();
        };
        let (result, ()) = tokio::join!(run, cancel);

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(client.transport().cancels.load(Ordering::SeqCst), 1);
        assert!(client.transport().poll_count.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_cancel_during_submit_withdraws_job() {
        let transport = ScriptedTransport {
            submit_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let client = RemoteDelegationClient::new(transport, &settings(3));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let run = client.run(request(), ProgressReporter::noop("slideA"), cancel_rx);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_tx.send(()).unwrap();
        };
        let (result, ()) = tokio::join!(run, cancel);

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(
            *client.transport().cancelled_jobs.lock().unwrap(),
            vec!["job-1".to_string()]
        );
        assert_eq!(client.transport().poll_count.load(Ordering::SeqCst), 0);
    }
}
