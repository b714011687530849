//! Directory Watcher
//!
//! Recursive filesystem monitoring of the watch root using `notify`.
//! Raw notifications are debounced on a dedicated thread, filtered, then handed
//! to a tokio task that holds each file back until it has been stable for the
//! configured window.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::ignore::WatchFilter;
use super::scanner::SlideScanner;
use super::stability::{FileFingerprint, StabilityTracker};
use crate::core::settings::Settings;
use crate::core::{CoreError, CoreResult};

/// Events emitted by the directory watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A candidate slide has been stable for a full window
    FileAppeared(PathBuf),
    /// A file or directory under the root was deleted
    FileRemoved(PathBuf),
    /// The watch root itself disappeared (reported once)
    RootLost(PathBuf),
}

/// Watcher timing
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub stability_window: Duration,
    pub poll_interval: Duration,
    /// Debounce applied to raw notify events
    pub debounce: Duration,
    /// Report files present at start
    pub scan_on_start: bool,
}

impl WatcherConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            stability_window: settings.watch.stability_window(),
            poll_interval: settings.watch.poll_interval(),
            debounce: Duration::from_millis(500),
            scan_on_start: settings.watch.scan_on_start,
        }
    }
}

/// Filtered notification passed from the notify thread to the stability task
#[derive(Debug)]
enum RawChange {
    File(PathBuf),
    Directory(PathBuf),
    Removed(PathBuf),
}

/// File system watcher for the watch root
pub struct DirectoryWatcher {
    /// Dropping this stops the notify thread
    stop_tx: Option<oneshot::Sender<()>>,
    stability_task: Option<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Starts watching. Must be called within a tokio runtime.
    ///
    /// Fails when the root does not exist or cannot be watched.
    pub fn start(
        config: WatcherConfig,
        filter: Arc<WatchFilter>,
        event_tx: mpsc::UnboundedSender<WatchEvent>,
    ) -> CoreResult<Self> {
        let root = filter.root().to_path_buf();
        if !root.is_dir() {
            return Err(CoreError::WatchRootMissing(root.display().to_string()));
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(config.debounce, tx)
            .map_err(|e| CoreError::WatcherFailed(format!("Failed to create file watcher: {}", e)))?;
        debouncer
            .watcher()
            .watch(&root, notify::RecursiveMode::Recursive)
            .map_err(|e| CoreError::WatcherFailed(format!("Failed to watch directory: {}", e)))?;

        let thread_filter = Arc::clone(&filter);
        let thread_root = root.clone();
        std::thread::Builder::new()
            .name("slidepipe-watcher".to_string())
            .spawn(move || {
                // Keep the debouncer alive
                let _debouncer = debouncer;

                loop {
                    if !matches!(stop_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                        tracing::debug!("Directory watcher stopped by signal");
                        break;
                    }

                    match rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(Ok(events)) => {
                            for event in events {
                                // Debouncer-mini does not distinguish create from
                                // modify or delete; classify by what is on disk now.
                                let change = match event.kind {
                                    DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous => {
                                        classify(&thread_root, &thread_filter, event.path)
                                    }
                                    _ => None,
                                };
                                let Some(change) = change else {
                                    continue;
                                };
                                if raw_tx.send(change).is_err() {
                                    tracing::debug!("Stability task gone, stopping watcher thread");
                                    return;
                                }
                            }
                        }
                        Ok(Err(error)) => {
                            tracing::warn!(error = %error, "File watcher error");
                        }
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                            tracing::debug!("File watcher channel disconnected, stopping");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| CoreError::WatcherFailed(format!("Failed to spawn watcher thread: {}", e)))?;

        let scanner = SlideScanner::new(Arc::clone(&filter));
        let initial = if config.scan_on_start {
            scanner.scan()
        } else {
            Vec::new()
        };
        tracing::info!(
            root = %root.display(),
            existing = initial.len(),
            window_ms = config.stability_window.as_millis() as u64,
            "Directory watcher started"
        );

        let stability_task = tokio::spawn(async move {
            let mut tracker = StabilityTracker::new(config.stability_window);
            let started = Instant::now().into_std();
            for slide in initial {
                tracker.observe(slide.absolute_path, slide.fingerprint, started);
            }
            run_stability_loop(root, config, scanner, tracker, raw_rx, event_tx).await;
        });

        Ok(Self {
            stop_tx: Some(stop_tx),
            stability_task: Some(stability_task),
        })
    }

    /// Stops the notify thread and the stability task
    pub fn stop(&mut self) {
        // Dropping the sender signals the thread to stop
        self.stop_tx.take();
        if let Some(task) = self.stability_task.take() {
            task.abort();
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn classify(root: &std::path::Path, filter: &WatchFilter, path: PathBuf) -> Option<RawChange> {
    if path.as_path() == root {
        return (!path.exists()).then_some(RawChange::Removed(path));
    }
    if !path.starts_with(root) {
        return None;
    }

    match std::fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => {
            (!filter.is_ignored_dir(&path)).then_some(RawChange::Directory(path))
        }
        Ok(_) => filter.accepts(&path).then_some(RawChange::File(path)),
        // Removals are reported unfiltered so a deleted directory cancels its contents.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(RawChange::Removed(path)),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable path");
            None
        }
    }
}

async fn run_stability_loop(
    root: PathBuf,
    config: WatcherConfig,
    scanner: SlideScanner,
    mut tracker: StabilityTracker,
    mut raw_rx: mpsc::UnboundedReceiver<RawChange>,
    event_tx: mpsc::UnboundedSender<WatchEvent>,
) {
    let mut tick = tokio::time::interval(config.poll_interval.max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut root_lost = false;

    loop {
        tokio::select! {
            change = raw_rx.recv() => {
                let Some(change) = change else {
                    break;
                };
                let now = Instant::now().into_std();
                match change {
                    RawChange::File(path) => {
                        if let Ok(fingerprint) = FileFingerprint::probe(&path) {
                            tracker.observe(path, fingerprint, now);
                        }
                    }
                    RawChange::Directory(dir) => {
                        for slide in scanner.scan_dir(&dir) {
                            tracker.observe(slide.absolute_path, slide.fingerprint, now);
                        }
                    }
                    RawChange::Removed(path) if path == root => {
                        if !root_lost {
                            root_lost = true;
                            tracing::error!(root = %root.display(), "Watch root disappeared");
                            if event_tx.send(WatchEvent::RootLost(path)).is_err() {
                                break;
                            }
                        }
                    }
                    RawChange::Removed(path) => {
                        tracker.forget(&path);
                        tracing::debug!(path = %path.display(), "Path removed");
                        if event_tx.send(WatchEvent::FileRemoved(path)).is_err() {
                            break;
                        }
                    }
                }
            }
            _ = tick.tick() => {
                if !root_lost && !root.is_dir() {
                    root_lost = true;
                    tracing::error!(root = %root.display(), "Watch root disappeared");
                    if event_tx.send(WatchEvent::RootLost(root.clone())).is_err() {
                        break;
                    }
                }
                if tracker.is_empty() {
                    continue;
                }
                let ready = tracker.poll(Instant::now().into_std(), FileFingerprint::probe);
                for path in ready {
                    tracing::debug!(path = %path.display(), "File is stable");
                    if event_tx.send(WatchEvent::FileAppeared(path)).is_err() {
                        return;
                    }
                }
            }
        }
    }

    tracing::debug!("Stability task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window_ms: u64) -> WatcherConfig {
        WatcherConfig {
            stability_window: Duration::from_millis(window_ms),
            poll_interval: Duration::from_millis(50),
            debounce: Duration::from_millis(100),
            scan_on_start: true,
        }
    }

    fn filter(root: &std::path::Path) -> Arc<WatchFilter> {
        Arc::new(WatchFilter::new(
            root.to_path_buf(),
            &["svs".to_string()],
            vec![root.join("converted")],
            &[],
        ))
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> Option<WatchEvent> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.watch.stability_window_ms = 1234;
        settings.watch.scan_on_start = false;

        let config = WatcherConfig::from_settings(&settings);
        assert_eq!(config.stability_window, Duration::from_millis(1234));
        assert!(!config.scan_on_start);
    }

    #[tokio::test]
    async fn test_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = DirectoryWatcher::start(config(100), filter(&dir.path().join("missing")), tx);
        assert!(matches!(result, Err(CoreError::WatchRootMissing(_))));
    }

    #[tokio::test]
    async fn test_existing_files_reported_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let slide = dir.path().join("existing.svs");
        std::fs::write(&slide, b"slide").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"text").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = DirectoryWatcher::start(config(200), filter(dir.path()), tx).unwrap();

        assert_eq!(next_event(&mut rx).await, Some(WatchEvent::FileAppeared(slide)));
        watcher.stop();
    }

    #[tokio::test]
    async fn test_relative_root_reports_live_files() {
        let dir = tempfile::Builder::new()
            .prefix("watch-relative-")
            .tempdir_in(".")
            .unwrap();
        let root = dir.path().join("incoming");
        assert!(root.is_relative());
        std::fs::create_dir_all(&root).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = DirectoryWatcher::start(config(200), filter(&root), tx).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(root.join("live.svs"), b"slide").unwrap();

        let expected = std::fs::canonicalize(&root).unwrap().join("live.svs");
        assert_eq!(next_event(&mut rx).await, Some(WatchEvent::FileAppeared(expected)));
    }

    #[tokio::test]
    async fn test_new_file_reported_after_window() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = DirectoryWatcher::start(config(300), filter(dir.path()), tx).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let slide = dir.path().join("new.svs");
        let written = std::time::Instant::now();
        std::fs::write(&slide, b"slide").unwrap();

        assert_eq!(next_event(&mut rx).await, Some(WatchEvent::FileAppeared(slide)));
        assert!(written.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_growing_file_waits_until_stable() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = DirectoryWatcher::start(config(400), filter(dir.path()), tx).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let slide = dir.path().join("growing.svs");
        for chunk in 0..8u8 {
            let mut data = std::fs::read(&slide).unwrap_or_default();
            data.extend_from_slice(&[chunk; 64]);
            std::fs::write(&slide, &data).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(rx.try_recv().is_err(), "reported while still growing");
        }
        let settled = std::time::Instant::now();

        assert_eq!(next_event(&mut rx).await, Some(WatchEvent::FileAppeared(slide)));
        assert!(settled.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_ignored_files_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = DirectoryWatcher::start(config(100), filter(dir.path()), tx).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("readme.txt"), b"text").unwrap();
        std::fs::write(dir.path().join("slide.svs.part"), b"partial").unwrap();
        std::fs::write(dir.path().join(".hidden.svs"), b"hidden").unwrap();

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_removed_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let slide = dir.path().join("gone.svs");
        std::fs::write(&slide, b"slide").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = DirectoryWatcher::start(config(100), filter(dir.path()), tx).unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            Some(WatchEvent::FileAppeared(slide.clone()))
        );
        std::fs::remove_file(&slide).unwrap();

        assert_eq!(next_event(&mut rx).await, Some(WatchEvent::FileRemoved(slide)));
    }

    #[tokio::test]
    async fn test_lost_root_reported_once() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("incoming");
        std::fs::create_dir_all(&root).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = DirectoryWatcher::start(config(100), filter(&root), tx).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::remove_dir_all(&root).unwrap();

        assert_eq!(next_event(&mut rx).await, Some(WatchEvent::RootLost(root)));
        tokio::time::sleep(Duration::from_millis(500)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, WatchEvent::RootLost(_)));
        }
    }
}
