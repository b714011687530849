//! Worker Pool Module
//!
//! A single coordination task receives every request as a message, runs the
//! admission checks, binds queued tasks to free slots and reacts to pipeline
//! results. Each running task executes in its own tokio task and reports back
//! with `SlotFinished`, so a hung conversion only ever occupies its own slot.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{CancelOutcome, SubmitOutcome, WorkerPoolConfig};
use crate::core::admission::{AdmissionDecision, AdmissionStore, StabilityGate};
use crate::core::events::{EventBus, ProgressEvent, TaskEvent};
use crate::core::pipeline::{
    ConversionOutput, ConversionPipeline, ConversionRequest, PipelineError, ProgressReporter,
    ProgressSink,
};
use crate::core::settings::{OutputSettings, Settings};
use crate::core::tasks::{ConversionTask, TaskQueue, TaskState, TaskStatus};
use crate::core::{CoreError, CoreResult, TaskId, TaskKey};

// =============================================================================
// Commands
// =============================================================================

enum PoolCommand {
    FileAppeared(PathBuf),
    FileRemoved(PathBuf),
    Submit {
        path: PathBuf,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    Cancel {
        task_key: TaskKey,
        reply: oneshot::Sender<CancelOutcome>,
    },
    Status {
        task_key: TaskKey,
        reply: oneshot::Sender<Option<TaskStatus>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<TaskStatus>>,
    },
    QueueLen {
        reply: oneshot::Sender<usize>,
    },
    /// A deferred admission is due for re-evaluation
    Recheck(PathBuf),
    /// A retry delay elapsed
    RetryDue { task_key: TaskKey, task_id: TaskId },
    /// A pipeline returned
    SlotFinished {
        slot: usize,
        task_key: TaskKey,
        task_id: TaskId,
        result: Result<ConversionOutput, PipelineError>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// =============================================================================
// Worker Pool Handle
// =============================================================================

/// Cloneable handle to a running worker pool
#[derive(Clone)]
pub struct WorkerPoolHandle {
    tx: mpsc::UnboundedSender<PoolCommand>,
    bus: Arc<EventBus>,
}

impl WorkerPoolHandle {
    fn send(&self, command: PoolCommand) -> CoreResult<()> {
        self.tx.send(command).map_err(|_| CoreError::PoolClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> CoreResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| CoreError::PoolClosed)
    }

    /// Reports a stable file from the watcher
    pub fn file_appeared(&self, path: PathBuf) -> CoreResult<()> {
        self.send(PoolCommand::FileAppeared(path))
    }

    /// Reports a deleted file (or directory) from the watcher
    pub fn file_removed(&self, path: PathBuf) -> CoreResult<()> {
        self.send(PoolCommand::FileRemoved(path))
    }

    /// Runs the admission checks for `path` and reports the decision
    pub async fn submit(&self, path: impl Into<PathBuf>) -> CoreResult<SubmitOutcome> {
        let path = path.into();
        self.request(|reply| PoolCommand::Submit { path, reply })
            .await
    }

    /// Cancels the task with the given key
    pub async fn cancel(&self, task_key: &str) -> CoreResult<CancelOutcome> {
        let task_key = task_key.to_string();
        self.request(|reply| PoolCommand::Cancel { task_key, reply })
            .await
    }

    /// Live status, or the terminal status from recent history
    pub async fn status(&self, task_key: &str) -> CoreResult<Option<TaskStatus>> {
        let task_key = task_key.to_string();
        self.request(|reply| PoolCommand::Status { task_key, reply })
            .await
    }

    /// Statuses of every live task, oldest first
    pub async fn snapshot(&self) -> CoreResult<Vec<TaskStatus>> {
        self.request(|reply| PoolCommand::Snapshot { reply }).await
    }

    /// Number of tasks waiting for a slot
    pub async fn queue_len(&self) -> CoreResult<usize> {
        self.request(|reply| PoolCommand::QueueLen { reply }).await
    }

    /// Stops accepting work, cancels everything and waits for running
    /// pipelines to clean up. Calling it again is a no-op.
    pub async fn shutdown(&self) -> CoreResult<()> {
        match self.request(|reply| PoolCommand::Shutdown { reply }).await {
            Err(CoreError::PoolClosed) => Ok(()),
            other => other,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.bus.subscribe()
    }

    pub fn subscribe_task(&self, task_key: &str) -> broadcast::Receiver<TaskEvent> {
        self.bus.subscribe_task(task_key)
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Worker pool assembly; `spawn` starts the coordination task
pub struct WorkerPool {
    config: WorkerPoolConfig,
    gate: StabilityGate,
    output: OutputSettings,
    pipeline: Arc<dyn ConversionPipeline>,
    store: Arc<dyn AdmissionStore>,
    bus: Arc<EventBus>,
}

impl WorkerPool {
    pub fn new(
        settings: &Settings,
        pipeline: Arc<dyn ConversionPipeline>,
        store: Arc<dyn AdmissionStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config: WorkerPoolConfig::from_settings(settings),
            gate: StabilityGate::new(settings),
            output: settings.output.clone(),
            pipeline,
            store,
            bus,
        }
    }

    /// Overrides the configuration derived from settings
    pub fn with_config(mut self, config: WorkerPoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Starts the coordination task. Must be called within a tokio runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WorkerPoolHandle {
            tx: tx.clone(),
            bus: Arc::clone(&self.bus),
        };

        let slots = (0..self.config.max_concurrency.max(1)).map(|_| None).collect();
        let coordinator = Coordinator {
            queue: TaskQueue::new(),
            records: HashMap::new(),
            slots,
            history: VecDeque::new(),
            rechecks: HashMap::new(),
            self_tx: tx.downgrade(),
            shutdown_waiters: Vec::new(),
            shutting_down: false,
            pool: self,
        };
        tokio::spawn(coordinator.run(rx));

        handle
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Live bookkeeping for one task key
struct TaskRecord {
    task: ConversionTask,
    slot: Option<usize>,
    cancel_requested: bool,
    last_progress: Arc<Mutex<Option<ProgressEvent>>>,
    retry_timer: Option<JoinHandle<()>>,
    retry_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    fn new(task: ConversionTask) -> Self {
        Self {
            task,
            slot: None,
            cancel_requested: false,
            last_progress: Arc::new(Mutex::new(None)),
            retry_timer: None,
            retry_at: None,
        }
    }

    fn status(&self) -> TaskStatus {
        TaskStatus {
            task: self.task.clone(),
            slot: self.slot,
            last_progress: self
                .last_progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            next_retry_at: self.retry_at,
        }
    }
}

/// A worker slot bound to a running task
struct ActiveSlot {
    task_key: TaskKey,
    cancel_tx: Option<oneshot::Sender<()>>,
}

struct Coordinator {
    pool: WorkerPool,
    queue: TaskQueue,
    records: HashMap<TaskKey, TaskRecord>,
    slots: Vec<Option<ActiveSlot>>,
    history: VecDeque<TaskStatus>,
    /// Pending admission re-checks keyed by source path
    rechecks: HashMap<PathBuf, JoinHandle<()>>,
    self_tx: mpsc::WeakUnboundedSender<PoolCommand>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    shutting_down: bool,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PoolCommand>) {
        info!(
            slots = self.slots.len(),
            backend = self.pool.pipeline.name(),
            "Worker pool started"
        );

        let period = self
            .pool
            .config
            .stale_check_interval
            .max(Duration::from_secs(1));
        let mut stale_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        stale_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        // Every handle, timer and worker is gone.
                        self.begin_shutdown().await;
                        break;
                    };
                    self.handle(command).await;
                    if self.shutting_down && self.idle() {
                        break;
                    }
                }
                _ = stale_tick.tick() => self.report_stale(),
            }
        }

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!("Worker pool stopped");
    }

    fn idle(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    async fn handle(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::FileAppeared(path) => {
                if !self.shutting_down {
                    let outcome = self.admit(&path).await;
                    debug!(path = %path.display(), ?outcome, "Processed detected file");
                }
            }
            PoolCommand::FileRemoved(path) => self.source_removed(&path).await,
            PoolCommand::Submit { path, reply } => {
                // Dropping the reply reports a closed pool to the caller.
                if !self.shutting_down {
                    let outcome = self.admit(&path).await;
                    let _ = reply.send(outcome);
                }
            }
            PoolCommand::Cancel { task_key, reply } => {
                let outcome = self.cancel(&task_key, "cancel requested").await;
                let _ = reply.send(outcome);
            }
            PoolCommand::Status { task_key, reply } => {
                let _ = reply.send(self.status(&task_key));
            }
            PoolCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PoolCommand::QueueLen { reply } => {
                let _ = reply.send(self.queue.len());
            }
            PoolCommand::Recheck(path) => {
                self.rechecks.remove(&path);
                if !self.shutting_down {
                    let outcome = self.admit(&path).await;
                    debug!(path = %path.display(), ?outcome, "Re-checked deferred file");
                }
            }
            PoolCommand::RetryDue { task_key, task_id } => self.retry_due(&task_key, &task_id),
            PoolCommand::SlotFinished {
                slot,
                task_key,
                task_id,
                result,
            } => self.slot_finished(slot, &task_key, &task_id, result).await,
            PoolCommand::Shutdown { reply } => {
                self.shutdown_waiters.push(reply);
                self.begin_shutdown().await;
            }
        }

        self.schedule();
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    async fn admit(&mut self, path: &Path) -> SubmitOutcome {
        let decision = {
            let records = &self.records;
            self.pool
                .gate
                .evaluate(
                    path,
                    |key| records.get(key).map(|record| record.task.state),
                    self.pool.store.as_ref(),
                )
                .await
        };

        match decision {
            AdmissionDecision::Ignored => SubmitOutcome::Ignored,
            AdmissionDecision::Skipped { task_key, reason } => {
                debug!(task_key = %task_key, ?reason, "Skipping file");
                SubmitOutcome::Skipped { task_key, reason }
            }
            AdmissionDecision::Deferred {
                task_key,
                retry_after,
            } => {
                self.schedule_recheck(path, retry_after);
                SubmitOutcome::Deferred {
                    task_key,
                    retry_after_ms: retry_after.as_millis() as u64,
                }
            }
            AdmissionDecision::Vanished { task_key } => SubmitOutcome::Vanished { task_key },
            AdmissionDecision::Accepted(task) => self.accept(task).await,
        }
    }

    async fn accept(&mut self, task: ConversionTask) -> SubmitOutcome {
        let task_key = task.task_key.clone();
        let task_id = task.id.clone();

        if let Err(e) = self.queue.enqueue(task.clone()) {
            warn!(task_key = %task_key, error = %e, "Admitted task could not be queued");
            if let Err(e) = self.pool.store.remove(&task_key).await {
                warn!(task_key = %task_key, error = %e, "Failed to release admission key");
            }
            return SubmitOutcome::Skipped {
                task_key,
                reason: crate::core::admission::SkipReason::AlreadyQueued,
            };
        }

        info!(
            task_key = %task_key,
            task_id = %task_id,
            source = %task.source_path.display(),
            "Slide admitted"
        );

        self.pool.bus.publish(TaskEvent::Detected {
            task_key: task_key.clone(),
            source_path: task.source_path.clone(),
            timestamp: Utc::now(),
        });
        self.pool.bus.publish(TaskEvent::Queued {
            task_key: task_key.clone(),
            task_id: task_id.clone(),
            attempt: task.attempt(),
            timestamp: Utc::now(),
        });
        self.records.insert(task_key.clone(), TaskRecord::new(task));

        SubmitOutcome::Queued { task_key, task_id }
    }

    fn schedule_recheck(&mut self, path: &Path, delay: Duration) {
        let path = StabilityGate::absolutize(path);
        if self.rechecks.contains_key(&path) {
            return;
        }
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };

        debug!(path = %path.display(), delay_ms = delay.as_millis() as u64, "Scheduling admission re-check");
        let target = path.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(PoolCommand::Recheck(target));
        });
        self.rechecks.insert(path, timer);
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// Binds queue heads to free slots while both exist.
    fn schedule(&mut self) {
        while !self.shutting_down {
            let Some(slot) = self.slots.iter().position(Option::is_none) else {
                break;
            };
            let slack = self.slots.iter().filter(|s| s.is_none()).count();
            let Some(task) = self.queue.dequeue_next(slack) else {
                break;
            };
            self.start(slot, task);
        }
    }

    fn start(&mut self, slot: usize, mut task: ConversionTask) {
        let Some(record) = self.records.get_mut(&task.task_key) else {
            warn!(task_key = %task.task_key, "Dequeued task has no record, dropping");
            return;
        };

        task.state = TaskState::Running;
        record.task = task.clone();
        record.slot = Some(slot);
        *record
            .last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        let last_progress = Arc::clone(&record.last_progress);

        info!(
            task_key = %task.task_key,
            attempt = task.attempt(),
            slot,
            backend = self.pool.pipeline.name(),
            "Starting conversion"
        );
        self.pool.bus.publish(TaskEvent::Started {
            task_key: task.task_key.clone(),
            task_id: task.id.clone(),
            attempt: task.attempt(),
            slot,
            timestamp: Utc::now(),
        });

        let bus = Arc::clone(&self.pool.bus);
        let sink: ProgressSink = Arc::new(move |event: ProgressEvent| {
            *last_progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(event.clone());
            bus.publish(TaskEvent::Progress(event));
        });
        let reporter = ProgressReporter::new(
            task.task_key.clone(),
            self.pool.config.progress_interval,
            sink,
        );

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let request = ConversionRequest::for_task(&task, &self.pool.output);
        let pipeline = Arc::clone(&self.pool.pipeline);
        let tx = self.self_tx.upgrade();
        let task_key = task.task_key.clone();
        let task_id = task.id.clone();

        tokio::spawn(async move {
            let run = tokio::spawn(async move { pipeline.run(request, reporter, cancel_rx).await });
            let result = match run.await {
                Ok(result) => result,
                Err(e) => {
                    error!(task_key = %task_key, error = %e, "Conversion task aborted");
                    Err(PipelineError::Aborted(e.to_string()))
                }
            };
            if let Some(tx) = tx {
                let _ = tx.send(PoolCommand::SlotFinished {
                    slot,
                    task_key,
                    task_id,
                    result,
                });
            }
        });

        self.slots[slot] = Some(ActiveSlot {
            task_key: task.task_key,
            cancel_tx: Some(cancel_tx),
        });
    }

    async fn slot_finished(
        &mut self,
        slot: usize,
        task_key: &str,
        task_id: &str,
        result: Result<ConversionOutput, PipelineError>,
    ) {
        if let Some(entry) = self.slots.get_mut(slot) {
            if entry.as_ref().is_some_and(|active| active.task_key == task_key) {
                *entry = None;
            }
        }

        let Some(record) = self.records.get_mut(task_key) else {
            warn!(task_key = %task_key, "Finished task has no record");
            return;
        };
        if record.task.id != task_id {
            warn!(task_key = %task_key, "Ignoring result of a superseded task");
            return;
        }
        record.slot = None;
        let attempt = record.task.attempt();

        match result {
            Ok(output) => {
                info!(
                    task_key = %task_key,
                    attempt,
                    output = %output.output_path.display(),
                    "Conversion completed"
                );
                self.pool.bus.publish(TaskEvent::Completed {
                    task_key: task_key.to_string(),
                    output_path: output.output_path,
                    attempts: attempt,
                    timestamp: Utc::now(),
                });
                self.finish(task_key, TaskState::Completed).await;
            }
            Err(ref e) if e.is_cancelled() || record.cancel_requested => {
                info!(task_key = %task_key, attempt, "Conversion cancelled");
                self.pool.bus.publish(TaskEvent::cancelled(task_key));
                self.finish(task_key, TaskState::Cancelled).await;
            }
            Err(e) => {
                let message = e.to_string();
                record.task.last_error = Some(message.clone());
                if record.task.retry_count < self.pool.config.max_retries {
                    self.schedule_retry(task_key, message);
                } else {
                    error!(
                        task_key = %task_key,
                        attempts = attempt,
                        error = %message,
                        "Conversion failed, retries exhausted"
                    );
                    self.pool.bus.publish(TaskEvent::Failed {
                        task_key: task_key.to_string(),
                        error: message,
                        attempts: attempt,
                        timestamp: Utc::now(),
                    });
                    self.finish(task_key, TaskState::Failed).await;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Retries
    // -------------------------------------------------------------------------

    fn schedule_retry(&mut self, task_key: &str, error: String) {
        let delay = self.pool.config.retry_delay;
        let max_retries = self.pool.config.max_retries;
        let tx = self.self_tx.upgrade();
        let Some(record) = self.records.get_mut(task_key) else {
            return;
        };

        record.task.retry_count += 1;
        record.task.state = TaskState::Queued;
        record.retry_at = Some(
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        );

        warn!(
            task_key = %task_key,
            attempt = record.task.retry_count,
            max_retries,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Conversion attempt failed, retrying"
        );
        self.pool.bus.publish(TaskEvent::Retrying {
            task_key: task_key.to_string(),
            failed_attempt: record.task.retry_count,
            retry_in_ms: delay.as_millis() as u64,
            error,
            timestamp: Utc::now(),
        });

        let timer_key = task_key.to_string();
        let timer_id = record.task.id.clone();
        record.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx {
                let _ = tx.send(PoolCommand::RetryDue {
                    task_key: timer_key,
                    task_id: timer_id,
                });
            }
        }));
    }

    fn retry_due(&mut self, task_key: &str, task_id: &str) {
        let Some(record) = self.records.get_mut(task_key) else {
            return;
        };
        // A cancelled or superseded retry leaves nothing to do.
        if record.task.id != task_id || record.retry_timer.take().is_none() {
            return;
        }

        record.retry_at = None;
        record.task.enqueued_at = Utc::now();
        let task = record.task.clone();
        let attempt = task.attempt();

        if let Err(e) = self.queue.enqueue(task) {
            warn!(task_key = %task_key, error = %e, "Retry could not be queued");
            return;
        }
        self.pool.bus.publish(TaskEvent::Queued {
            task_key: task_key.to_string(),
            task_id: task_id.to_string(),
            attempt,
            timestamp: Utc::now(),
        });
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    async fn cancel(&mut self, task_key: &str, reason: &str) -> CancelOutcome {
        let Some(record) = self.records.get_mut(task_key) else {
            return CancelOutcome::NotFound;
        };

        if let Some(slot) = record.slot {
            if record.cancel_requested {
                return CancelOutcome::AlreadyCancelling;
            }
            record.cancel_requested = true;
            let cancel_tx = self
                .slots
                .get_mut(slot)
                .and_then(Option::as_mut)
                .and_then(|active| active.cancel_tx.take());
            if let Some(cancel_tx) = cancel_tx {
                let _ = cancel_tx.send(());
            }
            info!(task_key = %task_key, slot, reason, "Cancelling running conversion");
            return CancelOutcome::Cancelled;
        }

        if let Some(timer) = record.retry_timer.take() {
            timer.abort();
        }
        self.queue.remove(task_key);

        info!(task_key = %task_key, reason, "Cancelled pending conversion");
        self.pool.bus.publish(TaskEvent::cancelled(task_key));
        self.finish(task_key, TaskState::Cancelled).await;
        CancelOutcome::Cancelled
    }

    /// Cancels every task whose source is `path` or lies beneath it.
    async fn source_removed(&mut self, path: &Path) {
        let path = StabilityGate::absolutize(path);

        self.rechecks.retain(|pending, timer| {
            if pending.starts_with(&path) {
                timer.abort();
                false
            } else {
                true
            }
        });

        let affected: Vec<TaskKey> = self
            .records
            .values()
            .filter(|record| record.task.source_path.starts_with(&path))
            .map(|record| record.task.task_key.clone())
            .collect();

        for task_key in affected {
            self.cancel(&task_key, "source removed").await;
        }
    }

    // -------------------------------------------------------------------------
    // Terminal bookkeeping
    // -------------------------------------------------------------------------

    /// Drops all tracking for a key and keeps its terminal status in history.
    async fn finish(&mut self, task_key: &str, state: TaskState) {
        let Some(mut record) = self.records.remove(task_key) else {
            return;
        };
        if let Some(timer) = record.retry_timer.take() {
            timer.abort();
        }
        record.task.state = state;
        record.retry_at = None;
        record.slot = None;

        if self.history.len() >= self.pool.config.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(record.status());

        if let Err(e) = self.pool.store.remove(task_key).await {
            warn!(task_key = %task_key, error = %e, "Failed to release admission key");
        }
    }

    fn status(&self, task_key: &str) -> Option<TaskStatus> {
        self.records.get(task_key).map(TaskRecord::status).or_else(|| {
            self.history
                .iter()
                .rev()
                .find(|status| status.task.task_key == task_key)
                .cloned()
        })
    }

    fn snapshot(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> = self.records.values().map(TaskRecord::status).collect();
        statuses.sort_by_key(|status| status.task.enqueued_at);
        statuses
    }

    fn report_stale(&self) {
        let threshold = self.pool.config.stale_after;
        for task_key in self.queue.stale(Utc::now(), threshold) {
            warn!(
                task_key = %task_key,
                threshold_secs = threshold.as_secs(),
                "Task has been queued for longer than the stale threshold"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    async fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        let running = self.slots.iter().filter(|s| s.is_some()).count();
        info!(running, queued = self.queue.len(), "Shutting down worker pool");

        for (_, timer) in self.rechecks.drain() {
            timer.abort();
        }

        let keys: Vec<TaskKey> = self.records.keys().cloned().collect();
        for task_key in keys {
            self.cancel(&task_key, "shutdown").await;
        }
    }
}
