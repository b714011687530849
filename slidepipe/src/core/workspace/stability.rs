//! Stability window tracking.
//!
//! A file is only reported once its size and modification time have stayed
//! unchanged for a full window. The tracker is driven by the watcher's poll
//! tick and never blocks.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

/// Size and mtime observed for a file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileFingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl FileFingerprint {
    pub fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }

    /// Reads the fingerprint of a regular file.
    pub fn probe(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        }
        Ok(Self::of(&metadata))
    }
}

#[derive(Debug)]
struct Observation {
    fingerprint: FileFingerprint,
    unchanged_since: Instant,
}

/// Pending files waiting out the stability window
#[derive(Debug)]
pub struct StabilityTracker {
    window: Duration,
    pending: HashMap<PathBuf, Observation>,
}

impl StabilityTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Records activity on `path`. A changed fingerprint restarts the window.
    pub fn observe(&mut self, path: PathBuf, fingerprint: FileFingerprint, now: Instant) {
        match self.pending.get_mut(&path) {
            Some(observation) if observation.fingerprint == fingerprint => {}
            Some(observation) => {
                observation.fingerprint = fingerprint;
                observation.unchanged_since = now;
            }
            None => {
                self.pending.insert(
                    path,
                    Observation {
                        fingerprint,
                        unchanged_since: now,
                    },
                );
            }
        }
    }

    /// Drops `path` and anything beneath it. Returns how many entries went.
    pub fn forget(&mut self, path: &Path) -> usize {
        let before = self.pending.len();
        self.pending.retain(|pending, _| !pending.starts_with(path));
        before - self.pending.len()
    }

    /// Re-probes every pending file and returns those stable for a full window.
    ///
    /// Files whose probe fails (vanished mid-check) are dropped silently.
    pub fn poll(
        &mut self,
        now: Instant,
        probe: impl Fn(&Path) -> io::Result<FileFingerprint>,
    ) -> Vec<PathBuf> {
        let window = self.window;
        let mut ready = Vec::new();

        self.pending.retain(|path, observation| {
            let current = match probe(path) {
                Ok(current) => current,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Pending file vanished");
                    return false;
                }
            };

            if current != observation.fingerprint {
                observation.fingerprint = current;
                observation.unchanged_since = now;
                return true;
            }

            if now.saturating_duration_since(observation.unchanged_since) >= window {
                ready.push(path.clone());
                return false;
            }
            true
        });

        ready.sort();
        ready
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.pending.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(len: u64) -> FileFingerprint {
        FileFingerprint {
            len,
            modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(len)),
        }
    }

    #[test]
    fn test_reports_after_full_window() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(5));
        let t0 = Instant::now();
        tracker.observe(PathBuf::from("/in/a.svs"), fp(10), t0);

        assert!(tracker.poll(t0 + Duration::from_secs(4), |_| Ok(fp(10))).is_empty());
        let ready = tracker.poll(t0 + Duration::from_secs(5), |_| Ok(fp(10)));
        assert_eq!(ready, vec![PathBuf::from("/in/a.svs")]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_changing_file_keeps_being_deferred() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(5));
        let t0 = Instant::now();
        tracker.observe(PathBuf::from("/in/a.svs"), fp(1), t0);

        // Grows every poll for 12 seconds.
        let mut size = 1;
        for second in 1..=12 {
            size += 1;
            let current = fp(size);
            let ready = tracker.poll(t0 + Duration::from_secs(second), |_| Ok(current));
            assert!(ready.is_empty(), "reported while changing at {}s", second);
        }

        // Settled at 12s: not ready before 17s.
        let settled = fp(size);
        assert!(tracker.poll(t0 + Duration::from_secs(16), |_| Ok(settled)).is_empty());
        assert_eq!(
            tracker.poll(t0 + Duration::from_secs(17), |_| Ok(settled)).len(),
            1
        );
    }

    #[test]
    fn test_observe_with_new_fingerprint_restarts_window() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(5));
        let t0 = Instant::now();
        let path = PathBuf::from("/in/a.svs");
        tracker.observe(path.clone(), fp(1), t0);
        tracker.observe(path.clone(), fp(2), t0 + Duration::from_secs(3));

        assert!(tracker.poll(t0 + Duration::from_secs(6), |_| Ok(fp(2))).is_empty());
        assert_eq!(tracker.poll(t0 + Duration::from_secs(8), |_| Ok(fp(2))), vec![path]);
    }

    #[test]
    fn test_repeated_observe_does_not_restart_window() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(5));
        let t0 = Instant::now();
        let path = PathBuf::from("/in/a.svs");
        tracker.observe(path.clone(), fp(1), t0);
        tracker.observe(path.clone(), fp(1), t0 + Duration::from_secs(4));

        assert_eq!(tracker.poll(t0 + Duration::from_secs(5), |_| Ok(fp(1))), vec![path]);
    }

    #[test]
    fn test_vanished_file_dropped() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(1));
        let t0 = Instant::now();
        tracker.observe(PathBuf::from("/in/a.svs"), fp(1), t0);

        let ready = tracker.poll(t0 + Duration::from_secs(2), |_| {
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        });
        assert!(ready.is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_forget_removes_nested_paths() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(1));
        let t0 = Instant::now();
        tracker.observe(PathBuf::from("/in/case/a.svs"), fp(1), t0);
        tracker.observe(PathBuf::from("/in/case/b.svs"), fp(1), t0);
        tracker.observe(PathBuf::from("/in/c.svs"), fp(1), t0);

        assert_eq!(tracker.forget(Path::new("/in/case")), 2);
        assert!(tracker.contains(Path::new("/in/c.svs")));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_probe_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileFingerprint::probe(dir.path()).is_err());

        let file = dir.path().join("a.svs");
        std::fs::write(&file, b"1234").unwrap();
        assert_eq!(FileFingerprint::probe(&file).unwrap().len, 4);
    }
}
