//! Watch Filter
//!
//! Decides which paths under the watch root are candidate slides. Combines the
//! supported extension set, built-in exclusions (dotfiles, partial downloads,
//! the output and work directories) and user patterns from a
//! `.slidepipeignore` file using gitignore-compatible globs via `globset`.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::core::{extension_of, resolve_dir};
use crate::core::settings::Settings;

/// Name of the user ignore file at the watch root
pub const IGNORE_FILE: &str = ".slidepipeignore";

/// Suffixes written by browsers and download managers while a transfer runs
const PARTIAL_EXTENSIONS: &[&str] = &["tmp", "part", "crdownload", "partial", "download", "!qb"];

/// Path filter for the directory watcher and the startup scan
#[derive(Debug, Clone)]
pub struct WatchFilter {
    root: PathBuf,
    extensions: HashSet<String>,
    /// Absolute directories never reported (output root, work dir)
    excluded: Vec<PathBuf>,
    globset: GlobSet,
    patterns: Vec<String>,
}

impl WatchFilter {
    /// Builds the filter for `settings`, reading `.slidepipeignore` from the
    /// watch root when present.
    pub fn load(settings: &Settings) -> Self {
        let root = settings.watch.watch_root.clone();
        let mut patterns = Vec::new();

        let ignore_path = root.join(IGNORE_FILE);
        if let Ok(content) = std::fs::read_to_string(&ignore_path) {
            patterns.extend(content.lines().map(str::to_string));
        }

        Self::new(
            root,
            &settings.watch.supported_extensions,
            vec![
                settings.output.output_root.clone(),
                settings.output.work_dir.clone(),
            ],
            &patterns,
        )
    }

    pub fn new(
        root: PathBuf,
        extensions: &[String],
        excluded: Vec<PathBuf>,
        patterns: &[String],
    ) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut valid_patterns = Vec::new();

        for pattern in patterns {
            let trimmed = pattern.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            match Glob::new(trimmed) {
                Ok(glob) => {
                    builder.add(glob);
                    valid_patterns.push(trimmed.to_string());
                }
                Err(e) => {
                    tracing::warn!(
                        pattern = trimmed,
                        error = %e,
                        "Skipping invalid ignore pattern"
                    );
                }
            }
        }

        let globset = builder.build().unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to build ignore globset, using empty set");
            GlobSet::empty()
        });

        // notify reports absolute paths, so compare against resolved ones.
        let root = resolve_dir(&root);

        // Only exclusions nested under the root can ever match.
        let excluded = excluded
            .into_iter()
            .map(|dir| resolve_dir(&dir))
            .filter(|dir| dir.starts_with(&root) && dir != &root)
            .collect();

        Self {
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
            root,
            excluded,
            globset,
            patterns: valid_patterns,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// True when `relative_path` matches a dotfile component or a user pattern.
    pub fn is_ignored(&self, relative_path: &Path) -> bool {
        let hidden = relative_path.components().any(|component| match component {
            Component::Normal(name) => name.to_string_lossy().starts_with('.'),
            _ => false,
        });
        if hidden {
            return true;
        }

        let path_str = relative_path.to_string_lossy().replace('\\', "/");
        if self.globset.is_match(&path_str) {
            return true;
        }

        // Directory-level patterns match on any prefix.
        let mut accumulated = String::new();
        for component in path_str.split('/') {
            if !accumulated.is_empty() {
                accumulated.push('/');
            }
            accumulated.push_str(component);

            if self.globset.is_match(&accumulated) {
                return true;
            }
        }

        false
    }

    /// True for directories the watcher and scanner never descend into.
    pub fn is_ignored_dir(&self, path: &Path) -> bool {
        if self.excluded.iter().any(|dir| path.starts_with(dir)) {
            return true;
        }
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => false,
            Ok(rel) => self.is_ignored(rel),
            Err(_) => true,
        }
    }

    /// True for an absolute file path that should be tracked as a slide.
    pub fn accepts(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        if rel.as_os_str().is_empty() || self.excluded.iter().any(|dir| path.starts_with(dir)) {
            return false;
        }
        if self.is_ignored(rel) || is_partial(path) {
            return false;
        }
        extension_of(path).is_some_and(|ext| self.extensions.contains(&ext))
    }
}

/// True for in-progress download markers such as `slide.svs.part`.
pub fn is_partial(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| PARTIAL_EXTENSIONS.contains(&ext.as_str()))
}
