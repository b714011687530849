//! Watch Root Scanner
//!
//! Enumerates slides already present under the watch root (or under a
//! directory that was moved in), applying the same filter as the watcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use super::ignore::WatchFilter;
use super::stability::FileFingerprint;

/// A slide found on disk
#[derive(Debug, Clone)]
pub struct DiscoveredSlide {
    /// Relative path within the watch root (forward slashes)
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub fingerprint: FileFingerprint,
}

/// Recursive directory scanner for candidate slides
pub struct SlideScanner {
    filter: Arc<WatchFilter>,
    max_depth: usize,
}

impl SlideScanner {
    pub fn new(filter: Arc<WatchFilter>) -> Self {
        Self {
            filter,
            max_depth: 32,
        }
    }

    /// Set the maximum directory depth for scanning
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Full scan of the watch root, sorted by relative path.
    pub fn scan(&self) -> Vec<DiscoveredSlide> {
        self.scan_dir(self.filter.root())
    }

    /// Scan of one directory beneath the watch root.
    pub fn scan_dir(&self, dir: &Path) -> Vec<DiscoveredSlide> {
        let mut slides = Vec::new();

        for entry in WalkDir::new(dir)
            .max_depth(self.max_depth)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_type().is_dir() || !self.filter.is_ignored_dir(e.path()))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unreadable entry during scan");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            if let Some(slide) = self.process_entry(entry.path()) {
                slides.push(slide);
            }
        }

        slides.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        slides
    }

    /// Returns the slide at `path` if it passes the filter and still exists.
    pub fn scan_path(&self, path: &Path) -> Option<DiscoveredSlide> {
        self.process_entry(path)
    }

    fn process_entry(&self, absolute_path: &Path) -> Option<DiscoveredSlide> {
        if !self.filter.accepts(absolute_path) {
            return None;
        }
        let rel_path = absolute_path.strip_prefix(self.filter.root()).ok()?;
        let fingerprint = FileFingerprint::probe(absolute_path).ok()?;

        Some(DiscoveredSlide {
            relative_path: rel_path.to_string_lossy().replace('\\', "/"),
            absolute_path: absolute_path.to_path_buf(),
            fingerprint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_tree(root: &Path) {
        std::fs::create_dir_all(root.join("case1/block2")).unwrap();
        std::fs::create_dir_all(root.join(".sync")).unwrap();
        std::fs::create_dir_all(root.join("converted/a_files")).unwrap();

        std::fs::write(root.join("a.svs"), "slide").unwrap();
        std::fs::write(root.join("case1/b.ndpi"), "slide").unwrap();
        std::fs::write(root.join("case1/block2/c.svs"), "slide").unwrap();

        // Not candidates
        std::fs::write(root.join("notes.txt"), "text").unwrap();
        std::fs::write(root.join("d.svs.part"), "partial").unwrap();
        std::fs::write(root.join(".sync/e.svs"), "hidden").unwrap();
        std::fs::write(root.join("converted/f.svs"), "output").unwrap();
    }

    fn scanner(root: &Path) -> SlideScanner {
        let filter = WatchFilter::new(
            root.to_path_buf(),
            &["svs".to_string(), "ndpi".to_string()],
            vec![root.join("converted")],
            &[],
        );
        SlideScanner::new(Arc::new(filter))
    }

    #[test]
    fn test_scan_finds_candidates_only() {
        let dir = tempdir().unwrap();
        create_test_tree(dir.path());

        let slides = scanner(dir.path()).scan();
        let paths: Vec<&str> = slides.iter().map(|s| s.relative_path.as_str()).collect();

        assert_eq!(paths, vec!["a.svs", "case1/b.ndpi", "case1/block2/c.svs"]);
        assert_eq!(slides[0].fingerprint.len, 5);
        assert!(slides[0].absolute_path.is_absolute());
    }

    #[test]
    fn test_scan_respects_max_depth() {
        let dir = tempdir().unwrap();
        create_test_tree(dir.path());

        let slides = scanner(dir.path()).with_max_depth(1).scan();
        assert_eq!(slides.len(), 1);
        assert_eq!(slides[0].relative_path, "a.svs");
    }

    #[test]
    fn test_scan_dir_limits_to_subtree() {
        let dir = tempdir().unwrap();
        create_test_tree(dir.path());

        let slides = scanner(dir.path()).scan_dir(&dir.path().join("case1"));
        assert_eq!(slides.len(), 2);
    }

    #[test]
    fn test_scan_path() {
        let dir = tempdir().unwrap();
        create_test_tree(dir.path());
        let s = scanner(dir.path());

        assert!(s.scan_path(&dir.path().join("a.svs")).is_some());
        assert!(s.scan_path(&dir.path().join("notes.txt")).is_none());
        assert!(s.scan_path(&dir.path().join("missing.svs")).is_none());
    }

    #[test]
    fn test_scan_empty_root() {
        let dir = tempdir().unwrap();
        assert!(scanner(dir.path()).scan().is_empty());
    }
}
