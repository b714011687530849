//! Conversion Service
//!
//! Wires the directory watcher, the worker pool and the event bus together.
//! This is the main entry point for embedding the converter.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::core::admission::{AdmissionStore, MemoryAdmissionStore};
use crate::core::events::{EventBus, TaskEvent};
use crate::core::jobs::{SubmitOutcome, WorkerPool, WorkerPoolHandle};
use crate::core::pipeline::{ConversionPipeline, ProcessPipeline};
use crate::core::settings::Settings;
use crate::core::CoreResult;

use super::ignore::WatchFilter;
use super::watcher::{DirectoryWatcher, WatchEvent, WatcherConfig};

/// Builds the conversion backend selected by `settings`
pub fn build_pipeline(settings: &Settings) -> CoreResult<Arc<dyn ConversionPipeline>> {
    #[cfg(feature = "remote")]
    {
        if settings.remote.enabled {
            use crate::core::remote::{HttpTransport, RemoteDelegationClient};

            let transport = HttpTransport::new(&settings.remote)?;
            tracing::info!(
                base_url = transport.base_url(),
                "Delegating conversions to remote service"
            );
            return Ok(Arc::new(RemoteDelegationClient::new(
                transport,
                &settings.remote,
            )));
        }
    }

    #[cfg(not(feature = "remote"))]
    {
        if settings.remote.enabled {
            tracing::warn!("Remote delegation requested but not compiled in, converting locally");
        }
    }

    let pipeline = ProcessPipeline::new(settings);
    tracing::info!(
        threads = pipeline.threads(),
        slots = settings.workers.max_concurrency,
        "Converting locally"
    );
    Ok(Arc::new(pipeline))
}

/// Watch folder conversion service
///
/// Owns the worker pool handle and, while watching, the directory watcher and
/// the task forwarding its events into the pool.
pub struct ConversionService {
    settings: Settings,
    pool: WorkerPoolHandle,
    watcher: Option<DirectoryWatcher>,
    forwarder: Option<JoinHandle<()>>,
}

impl ConversionService {
    /// Starts the pool and the directory watcher
    pub fn start(settings: Settings) -> CoreResult<Self> {
        let mut service = Self::open(settings)?;
        service.start_watching()?;
        Ok(service)
    }

    /// Starts the pool only; files are fed through [`ConversionService::submit`]
    pub fn open(mut settings: Settings) -> CoreResult<Self> {
        settings.normalize();
        let pipeline = build_pipeline(&settings)?;
        Self::with_pipeline(settings, pipeline, Arc::new(MemoryAdmissionStore::new()))
    }

    /// Starts the pool with an explicit backend and admission store
    pub fn with_pipeline(
        mut settings: Settings,
        pipeline: Arc<dyn ConversionPipeline>,
        store: Arc<dyn AdmissionStore>,
    ) -> CoreResult<Self> {
        settings.normalize();
        settings.resolve_paths();
        settings.validate()?;

        std::fs::create_dir_all(&settings.output.output_root)?;
        std::fs::create_dir_all(&settings.output.work_dir)?;
        // Canonical now that both directories exist.
        settings.resolve_paths();

        let bus = Arc::new(EventBus::new(settings.workers.event_buffer));
        let pool = WorkerPool::new(&settings, pipeline, store, bus).spawn();

        tracing::info!(
            watch_root = %settings.watch.watch_root.display(),
            output_root = %settings.output.output_root.display(),
            max_concurrency = settings.workers.max_concurrency,
            max_retries = settings.workers.max_retries,
            "Conversion service started"
        );

        Ok(Self {
            settings,
            pool,
            watcher: None,
            forwarder: None,
        })
    }

    /// Start watching the watch root
    pub fn start_watching(&mut self) -> CoreResult<()> {
        if self.watcher.is_some() {
            return Ok(());
        }

        let filter = Arc::new(WatchFilter::load(&self.settings));
        if !filter.patterns().is_empty() {
            tracing::info!(
                patterns = filter.patterns().len(),
                "Loaded ignore patterns"
            );
        }
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let watcher = DirectoryWatcher::start(
            WatcherConfig::from_settings(&self.settings),
            filter,
            event_tx,
        )?;

        self.forwarder = Some(tokio::spawn(forward_watch_events(
            event_rx,
            self.pool.clone(),
        )));
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Stop watching; queued and running conversions continue
    pub fn stop_watching(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
            tracing::info!("Directory watching stopped");
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn handle(&self) -> &WorkerPoolHandle {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.pool.subscribe()
    }

    pub async fn submit(&self, path: impl Into<PathBuf>) -> CoreResult<SubmitOutcome> {
        self.pool.submit(path).await
    }

    /// Stops watching, cancels all work and waits for running pipelines
    pub async fn shutdown(mut self) -> CoreResult<()> {
        self.stop_watching();
        self.pool.shutdown().await?;
        tracing::info!("Conversion service stopped");
        Ok(())
    }
}

impl Drop for ConversionService {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

async fn forward_watch_events(
    mut event_rx: mpsc::UnboundedReceiver<WatchEvent>,
    pool: WorkerPoolHandle,
) {
    while let Some(event) = event_rx.recv().await {
        let forwarded = match event {
            WatchEvent::FileAppeared(path) => pool.file_appeared(path),
            WatchEvent::FileRemoved(path) => pool.file_removed(path),
            WatchEvent::RootLost(root) => {
                tracing::warn!(
                    root = %root.display(),
                    "Watch root lost, continuing with queued and running conversions"
                );
                Ok(())
            }
        };
        if forwarded.is_err() {
            tracing::debug!("Worker pool closed, stopping watch event forwarding");
            break;
        }
    }
}
