//! Stability Gate
//!
//! Ordered, short-circuiting admission checks for a detected or submitted file.
//! Runs inside the pool's coordination task, so the outcome is atomic with
//! respect to enqueueing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::AdmissionStore;
use crate::core::settings::{OutputSettings, Settings};
use crate::core::tasks::{ConversionTask, TaskState};
use crate::core::{derive_task_key, extension_of, resolve_dir, resolve_file, TaskKey};

/// Why an otherwise valid file was not admitted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// The output artifact already exists
    AlreadyConverted,
    /// A task with this key is running
    AlreadyRunning,
    /// A task with this key is queued or waiting out a retry delay
    AlreadyQueued,
    /// The admission store reports the key as claimed
    ClaimedElsewhere,
}

/// Outcome of the admission checks
#[derive(Debug)]
pub enum AdmissionDecision {
    /// Not a supported slide; dropped silently
    Ignored,
    /// Valid slide that must not be enqueued now
    Skipped { task_key: TaskKey, reason: SkipReason },
    /// Modified too recently; evaluate again after `retry_after`
    Deferred { task_key: TaskKey, retry_after: Duration },
    /// Stat failed, the file is gone
    Vanished { task_key: TaskKey },
    /// New task whose key has been claimed in the admission store
    Accepted(ConversionTask),
}

/// Admission filter configured from the service settings
#[derive(Debug, Clone)]
pub struct StabilityGate {
    watch_root: PathBuf,
    supported_extensions: HashSet<String>,
    output: OutputSettings,
    min_file_age: Duration,
    recheck_delay: Duration,
}

impl StabilityGate {
    pub fn new(settings: &Settings) -> Self {
        Self {
            watch_root: resolve_dir(&settings.watch.watch_root),
            supported_extensions: settings
                .watch
                .supported_extensions
                .iter()
                .map(|ext| ext.to_ascii_lowercase())
                .collect(),
            output: settings.output.clone(),
            min_file_age: settings.watch.min_file_age(),
            recheck_delay: settings.watch.recheck_delay(),
        }
    }

    pub fn watch_root(&self) -> &Path {
        &self.watch_root
    }

    /// True when the file's extension is in the supported set
    pub fn is_supported(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| self.supported_extensions.contains(&ext))
    }

    /// Resolves a path the same way the watch root is resolved, so that
    /// relative submissions derive keys from their place under the root.
    pub fn absolutize(path: &Path) -> PathBuf {
        resolve_file(path)
    }

    /// Key under which `path` would be tracked, if it is a supported slide
    pub fn task_key_for(&self, path: &Path) -> Option<TaskKey> {
        if !self.is_supported(path) {
            return None;
        }
        derive_task_key(&self.watch_root, &Self::absolutize(path))
    }

    /// Runs the admission checks in order.
    ///
    /// `active_state` reports the state of a live task with the given key, if any.
    pub async fn evaluate(
        &self,
        path: &Path,
        active_state: impl Fn(&str) -> Option<TaskState>,
        store: &dyn AdmissionStore,
    ) -> AdmissionDecision {
        let path = Self::absolutize(path);

        if !self.is_supported(&path) {
            return AdmissionDecision::Ignored;
        }
        let Some(task_key) = derive_task_key(&self.watch_root, &path) else {
            return AdmissionDecision::Ignored;
        };

        let artifact = self.output.output_artifact(&task_key);
        if tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
            debug!(task_key = %task_key, artifact = %artifact.display(), "Output already exists");
            return AdmissionDecision::Skipped {
                task_key,
                reason: SkipReason::AlreadyConverted,
            };
        }

        match active_state(&task_key) {
            Some(TaskState::Running) => {
                return AdmissionDecision::Skipped {
                    task_key,
                    reason: SkipReason::AlreadyRunning,
                };
            }
            Some(TaskState::Queued) => {
                return AdmissionDecision::Skipped {
                    task_key,
                    reason: SkipReason::AlreadyQueued,
                };
            }
            _ => {}
        }

        match store.exists(&task_key).await {
            Ok(true) => {
                return AdmissionDecision::Skipped {
                    task_key,
                    reason: SkipReason::ClaimedElsewhere,
                };
            }
            Ok(false) => {}
            Err(e) => {
                warn!(task_key = %task_key, error = %e, "Admission store lookup failed, deferring");
                return AdmissionDecision::Deferred {
                    task_key,
                    retry_after: self.recheck_delay,
                };
            }
        }

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Source vanished during admission");
                return AdmissionDecision::Vanished { task_key };
            }
        };
        if !metadata.is_file() {
            return AdmissionDecision::Ignored;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .unwrap_or(Duration::ZERO);
        if age < self.min_file_age {
            debug!(
                task_key = %task_key,
                age_ms = age.as_millis() as u64,
                "Source modified too recently, deferring"
            );
            return AdmissionDecision::Deferred {
                task_key,
                retry_after: self.recheck_delay,
            };
        }

        match store.insert(&task_key).await {
            Ok(true) => AdmissionDecision::Accepted(ConversionTask::new(&path, task_key)),
            Ok(false) => AdmissionDecision::Skipped {
                task_key,
                reason: SkipReason::ClaimedElsewhere,
            },
            Err(e) => {
                warn!(task_key = %task_key, error = %e, "Admission store insert failed, deferring");
                AdmissionDecision::Deferred {
                    task_key,
                    retry_after: self.recheck_delay,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::admission::MemoryAdmissionStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        gate: StabilityGate,
        settings: Settings,
    }

    fn fixture(min_file_age_ms: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("incoming");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();

        let mut settings = Settings::default();
        settings.watch.watch_root = root.clone();
        settings.watch.min_file_age_ms = min_file_age_ms;
        settings.watch.recheck_delay_ms = 250;
        settings.output.output_root = dir.path().join("out");

        Fixture {
            gate: StabilityGate::new(&settings),
            _dir: dir,
            root,
            settings,
        }
    }

    fn none(_: &str) -> Option<TaskState> {
        None
    }

    #[tokio::test]
    async fn test_accepts_stable_file_and_claims_key() {
        let fx = fixture(0);
        let path = fx.root.join("slideA.svs");
        std::fs::write(&path, b"slide").unwrap();
        let store = MemoryAdmissionStore::new();

        let decision = fx.gate.evaluate(&path, none, &store).await;

        match decision {
            AdmissionDecision::Accepted(task) => {
                assert_eq!(task.task_key, "slideA");
                assert_eq!(task.source_path, path);
            }
            other => panic!("unexpected decision: {:?}", other),
        }
        assert!(store.exists("slideA").await.unwrap());
    }

    #[tokio::test]
    async fn test_unsupported_extension_is_ignored() {
        let fx = fixture(0);
        let path = fx.root.join("notes.txt");
        std::fs::write(&path, b"x").unwrap();

        let decision = fx.gate.evaluate(&path, none, &MemoryAdmissionStore::new()).await;
        assert!(matches!(decision, AdmissionDecision::Ignored));
    }

    #[tokio::test]
    async fn test_existing_output_skips() {
        let fx = fixture(0);
        let path = fx.root.join("slideA.svs");
        std::fs::write(&path, b"slide").unwrap();
        std::fs::write(fx.settings.output.output_artifact("slideA"), b"<Image/>").unwrap();

        let store = MemoryAdmissionStore::new();
        let decision = fx.gate.evaluate(&path, none, &store).await;

        assert!(matches!(
            decision,
            AdmissionDecision::Skipped { reason: SkipReason::AlreadyConverted, .. }
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_running_and_queued_keys_skip() {
        let fx = fixture(0);
        let path = fx.root.join("slideA.svs");
        std::fs::write(&path, b"slide").unwrap();
        let store = MemoryAdmissionStore::new();

        let running = fx
            .gate
            .evaluate(&path, |_| Some(TaskState::Running), &store)
            .await;
        assert!(matches!(
            running,
            AdmissionDecision::Skipped { reason: SkipReason::AlreadyRunning, .. }
        ));

        let queued = fx
            .gate
            .evaluate(&path, |_| Some(TaskState::Queued), &store)
            .await;
        assert!(matches!(
            queued,
            AdmissionDecision::Skipped { reason: SkipReason::AlreadyQueued, .. }
        ));
    }

    #[tokio::test]
    async fn test_claimed_key_skips() {
        let fx = fixture(0);
        let path = fx.root.join("slideA.svs");
        std::fs::write(&path, b"slide").unwrap();
        let store = MemoryAdmissionStore::new();
        store.insert("slideA").await.unwrap();

        let decision = fx.gate.evaluate(&path, none, &store).await;
        assert!(matches!(
            decision,
            AdmissionDecision::Skipped { reason: SkipReason::ClaimedElsewhere, .. }
        ));
    }

    #[tokio::test]
    async fn test_recent_file_is_deferred_not_dropped() {
        let fx = fixture(60_000);
        let path = fx.root.join("slideA.svs");
        std::fs::write(&path, b"slide").unwrap();
        let store = MemoryAdmissionStore::new();

        let decision = fx.gate.evaluate(&path, none, &store).await;

        match decision {
            AdmissionDecision::Deferred { task_key, retry_after } => {
                assert_eq!(task_key, "slideA");
                assert_eq!(retry_after, Duration::from_millis(250));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_vanished() {
        let fx = fixture(0);
        let decision = fx
            .gate
            .evaluate(&fx.root.join("gone.ndpi"), none, &MemoryAdmissionStore::new())
            .await;
        assert!(matches!(decision, AdmissionDecision::Vanished { .. }));
    }

    #[test]
    fn test_task_key_for_nested_path() {
        let fx = fixture(0);
        assert_eq!(
            fx.gate.task_key_for(&fx.root.join("case1/slideB.NDPI")),
            Some("case1__slideB".to_string())
        );
        assert_eq!(fx.gate.task_key_for(&fx.root.join("case1/readme.md")), None);
    }

    #[test]
    fn test_relative_watch_root_keeps_subfolders_in_key() {
        let mut settings = Settings::default();
        settings.watch.watch_root = PathBuf::from("incoming");
        let gate = StabilityGate::new(&settings);

        assert!(gate.watch_root().is_absolute());
        assert_eq!(
            gate.task_key_for(Path::new("incoming/a/slide.svs")),
            Some("a__slide".to_string())
        );
        assert_eq!(
            gate.task_key_for(Path::new("incoming/b/slide.svs")),
            Some("b__slide".to_string())
        );
    }
}
