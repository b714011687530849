//! Command handlers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use slidepipe_lib::core::admission::SkipReason;
use slidepipe_lib::core::events::TaskEvent;
use slidepipe_lib::core::jobs::SubmitOutcome;
use slidepipe_lib::core::tasks::TaskState;
use slidepipe_lib::core::{resolve_file, TaskKey};
use slidepipe_lib::{ConversionService, Settings, SettingsManager};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SettingsArgs;
use crate::error::CliError;

// =============================================================================
// watch
// =============================================================================

/// Runs the watch folder service until Ctrl-C.
pub async fn watch(args: &SettingsArgs) -> anyhow::Result<()> {
    let settings = args.load()?;
    let service = ConversionService::start(settings).map_err(CliError::from)?;
    let mut events = service.subscribe();

    info!(
        watch_root = %service.settings().watch.watch_root.display(),
        "Watching for slides, press Ctrl-C to stop"
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, shutting down");
                break;
            }
            received = events.recv() => match received {
                Ok(event) => emit(&event, args.json_events)?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event listener fell behind, some events were dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    service.shutdown().await.map_err(CliError::from)?;

    // Cancellations published while shutting down.
    while let Ok(event) = events.try_recv() {
        emit(&event, args.json_events)?;
    }
    Ok(())
}

// =============================================================================
// convert
// =============================================================================

/// A submitted file whose outcome `convert` still waits for
struct Pending {
    source: PathBuf,
    /// Admission was deferred and no task exists yet
    deferred: bool,
}

/// Files submitted by one `convert` run, keyed by task key
#[derive(Default)]
struct ConvertRun {
    /// Source of every key this run created or is waiting to create
    claimed: HashMap<TaskKey, PathBuf>,
    pending: HashMap<TaskKey, Pending>,
    failed: usize,
}

impl ConvertRun {
    /// Submits `file` and records what the outcome means for the run.
    async fn submit(&mut self, service: &ConversionService, file: &Path) -> anyhow::Result<()> {
        let source = resolve_file(file);
        let outcome = service.submit(source.clone()).await.map_err(CliError::from)?;

        if let Some(task_key) = outcome.task_key() {
            if let Some(other) = self.claimed.get(task_key).filter(|other| **other != source) {
                error!(
                    task_key = %task_key,
                    "{} maps to the same output as {}, not converting it",
                    file.display(),
                    other.display()
                );
                if matches!(outcome, SubmitOutcome::Queued { .. }) {
                    service.handle().cancel(task_key).await.map_err(CliError::from)?;
                }
                self.failed += 1;
                return Ok(());
            }
        }

        match outcome {
            SubmitOutcome::Queued { task_key, .. } => {
                self.claimed.insert(task_key.clone(), source.clone());
                self.pending.insert(
                    task_key,
                    Pending {
                        source,
                        deferred: false,
                    },
                );
            }
            SubmitOutcome::Deferred {
                task_key,
                retry_after_ms,
            } => {
                info!(
                    task_key = %task_key,
                    retry_after_ms,
                    "File changed recently, waiting before converting"
                );
                self.claimed.insert(task_key.clone(), source.clone());
                self.pending.insert(
                    task_key,
                    Pending {
                        source,
                        deferred: true,
                    },
                );
            }
            SubmitOutcome::Skipped {
                task_key,
                reason:
                    SkipReason::AlreadyQueued
                    | SkipReason::AlreadyRunning
                    | SkipReason::ClaimedElsewhere,
            } if self.claimed.contains_key(&task_key) => {
                // The pool's own re-check admitted it first.
                if let Some(pending) = self.pending.get_mut(&task_key) {
                    pending.deferred = false;
                }
            }
            SubmitOutcome::Skipped { task_key, reason } => {
                info!(task_key = %task_key, ?reason, "Skipping {}", file.display());
                self.pending.remove(&task_key);
            }
            SubmitOutcome::Vanished { task_key } => {
                error!(task_key = %task_key, "File not found: {}", file.display());
                self.pending.remove(&task_key);
                self.failed += 1;
            }
            SubmitOutcome::Ignored => {
                error!("Not a supported slide: {}", file.display());
                self.failed += 1;
            }
        }
        Ok(())
    }

    /// Submits deferred files again; the pool publishes nothing when a
    /// deferred file disappears or is skipped on its own re-check.
    async fn resubmit_deferred(&mut self, service: &ConversionService) -> anyhow::Result<()> {
        let deferred: Vec<PathBuf> = self
            .pending
            .values()
            .filter(|pending| pending.deferred)
            .map(|pending| pending.source.clone())
            .collect();
        for source in deferred {
            self.submit(service, &source).await?;
        }
        Ok(())
    }

    fn has_deferred(&self) -> bool {
        self.pending.values().any(|pending| pending.deferred)
    }

    fn on_event(&mut self, event: &TaskEvent) {
        if event.is_terminal()
            && self.pending.remove(event.task_key()).is_some()
            && !matches!(event, TaskEvent::Completed { .. })
        {
            self.failed += 1;
        }
    }

    fn abandon_pending(&mut self) {
        self.failed += self.pending.len();
        self.pending.clear();
    }

    /// Resolves pending keys whose terminal event was dropped.
    async fn settle_from_status(&mut self, service: &ConversionService) -> anyhow::Result<()> {
        let keys: Vec<TaskKey> = self.pending.keys().cloned().collect();
        for key in keys {
            let status = service.handle().status(&key).await.map_err(CliError::from)?;
            let Some(status) = status else {
                continue;
            };
            if status.state().is_terminal() {
                self.pending.remove(&key);
                if status.state() != TaskState::Completed {
                    self.failed += 1;
                }
            }
        }
        Ok(())
    }
}

/// Converts the given files through the pool and waits for every one.
pub async fn convert(files: &[PathBuf], args: &SettingsArgs) -> anyhow::Result<()> {
    let settings = args.load()?;
    let service = ConversionService::open(settings).map_err(CliError::from)?;
    let mut events = service.subscribe();

    let total = files.len();
    let mut run = ConvertRun::default();
    for file in files {
        run.submit(&service, file).await?;
    }

    let period = service.settings().watch.recheck_delay();
    let mut recheck = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !run.pending.is_empty() {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("Failed to listen for Ctrl-C")?;
                warn!(remaining = run.pending.len(), "Interrupted, cancelling remaining conversions");
                run.abandon_pending();
            }
            received = events.recv() => match received {
                Ok(event) => {
                    emit(&event, args.json_events)?;
                    run.on_event(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event listener fell behind, checking task status");
                    run.settle_from_status(&service).await?;
                }
                Err(RecvError::Closed) => run.abandon_pending(),
            },
            _ = recheck.tick(), if run.has_deferred() => {
                run.resubmit_deferred(&service).await?;
            }
        }
    }

    service.shutdown().await.map_err(CliError::from)?;

    if run.failed > 0 {
        return Err(CliError::ConversionsFailed {
            failed: run.failed,
            total,
        }
        .into());
    }
    info!(total, "All conversions finished");
    Ok(())
}

// =============================================================================
// init-config
// =============================================================================

/// Writes the default settings file and returns its path.
pub fn init_config(path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let manager = match path {
        Some(path) => SettingsManager::with_path(path),
        None => SettingsManager::default_location().ok_or_else(|| {
            CliError::Config("no per-user config directory on this platform, pass a path".into())
        })?,
    };

    if manager.settings_path().exists() {
        return Err(CliError::Config(format!(
            "{} already exists",
            manager.settings_path().display()
        ))
        .into());
    }

    manager
        .save(&Settings::default())
        .with_context(|| format!("Failed to write {}", manager.settings_path().display()))?;
    Ok(manager.settings_path().clone())
}

// =============================================================================
// Event output
// =============================================================================

fn emit(event: &TaskEvent, json: bool) -> anyhow::Result<()> {
    log_event(event);
    if json {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}

fn log_event(event: &TaskEvent) {
    match event {
        TaskEvent::Progress(progress) => debug!(
            task_key = %progress.task_key,
            phase = ?progress.phase,
            percent = progress.percent,
            "Progress"
        ),
        TaskEvent::Started {
            task_key,
            attempt,
            slot,
            ..
        } => info!(task_key = %task_key, attempt, slot, "Started"),
        TaskEvent::Retrying {
            task_key,
            failed_attempt,
            retry_in_ms,
            error,
            ..
        } => warn!(
            task_key = %task_key,
            failed_attempt,
            retry_in_ms,
            "Attempt failed, retrying: {}",
            error
        ),
        TaskEvent::Completed {
            task_key,
            output_path,
            attempts,
            ..
        } => info!(
            task_key = %task_key,
            attempts,
            output = %output_path.display(),
            "Completed"
        ),
        TaskEvent::Failed {
            task_key,
            error,
            attempts,
            ..
        } => error!(task_key = %task_key, attempts, "Failed: {}", error),
        other => info!(task_key = %other.task_key(), event = other.kind(), "Task event"),
    }
}
