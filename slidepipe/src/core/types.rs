//! slidepipe Core Type Definitions
//!
//! Defines fundamental types used throughout the orchestration core.

use std::path::{Component, Path, PathBuf};

// =============================================================================
// ID Types
// =============================================================================

/// Task unique identifier (ULID), fresh for every created task
pub type TaskId = String;

/// Collision-free task key derived from the source path relative to the watch root.
///
/// Doubles as the output artifact's base name.
pub type TaskKey = String;

// =============================================================================
// Task Key Derivation
// =============================================================================

/// Separator placed between flattened path segments.
const SEGMENT_SEPARATOR: &str = "__";

/// Derives the task key for `path` relative to `watch_root`.
///
/// The final extension is dropped so that `slide.svs` and `slide.tif` in the
/// same folder share a key (they would produce the same output artifact).
/// Each segment is encoded injectively and segments are joined with `__`;
/// an encoded segment never contains `__`, so distinct relative paths never
/// collide. Paths outside the watch root fall back to their file name.
///
/// Returns `None` when the path has no usable file name.
pub fn derive_task_key(watch_root: &Path, path: &Path) -> Option<TaskKey> {
    let relative = path.strip_prefix(watch_root).ok().filter(|rel| {
        rel.components()
            .all(|component| matches!(component, Component::Normal(_)))
    });

    let relative = match relative {
        Some(rel) if rel.file_name().is_some() => rel.to_path_buf(),
        _ => Path::new(path.file_name()?).to_path_buf(),
    };

    let stem = relative.file_stem()?.to_string_lossy().to_string();
    if stem.is_empty() {
        return None;
    }

    let mut segments: Vec<String> = relative
        .parent()
        .map(|parent| {
            parent
                .components()
                .filter_map(|component| match component {
                    Component::Normal(segment) => Some(encode_segment(&segment.to_string_lossy())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    segments.push(encode_segment(&stem));

    Some(segments.join(SEGMENT_SEPARATOR))
}

/// Encodes one path segment: ASCII alphanumerics, `-` and `.` pass through,
/// every other byte (including `_`) becomes `_xx` in lowercase hex.
fn encode_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("_{:02x}", byte));
        }
    }
    encoded
}

// =============================================================================
// Path Resolution
// =============================================================================

/// Absolute form of a configured directory: canonical when it exists,
/// otherwise joined onto the working directory.
pub fn resolve_dir(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Absolute form of a file path.
///
/// Only the parent directory is canonicalized, so a symlinked slide keeps its
/// own name and a path that no longer exists still resolves.
pub fn resolve_file(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|parent| parent.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

/// Returns the lowercase extension of `path`, if any.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_for_top_level_file() {
        let root = PathBuf::from("/data/incoming");
        let key = derive_task_key(&root, &root.join("slideA.svs")).unwrap();
        assert_eq!(key, "slideA");
    }

    #[test]
    fn test_key_flattens_subfolders() {
        let root = PathBuf::from("/data/incoming");
        let key = derive_task_key(&root, &root.join("case-12/block.3/slide1.ndpi")).unwrap();
        assert_eq!(key, "case-12__block.3__slide1");
    }

    #[test]
    fn test_key_ignores_extension() {
        let root = PathBuf::from("/data/incoming");
        let a = derive_task_key(&root, &root.join("lab/slide.svs")).unwrap();
        let b = derive_task_key(&root, &root.join("lab/slide.tif")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_is_collision_free_for_underscores() {
        let root = PathBuf::from("/data/incoming");
        let nested = derive_task_key(&root, &root.join("a/b_c.svs")).unwrap();
        let flat = derive_task_key(&root, &root.join("a_b/c.svs")).unwrap();
        let joined = derive_task_key(&root, &root.join("a__b/c.svs")).unwrap();
        assert_ne!(nested, flat);
        assert_ne!(flat, joined);
        assert_ne!(nested, joined);
        assert!(!flat.contains("a__b"));
    }

    #[test]
    fn test_key_encodes_spaces_and_unicode() {
        let root = PathBuf::from("/data/incoming");
        let key = derive_task_key(&root, &root.join("my slide é.svs")).unwrap();
        assert_eq!(key, "my_20slide_20_c3_a9");
    }

    #[test]
    fn test_key_outside_root_uses_file_name() {
        let root = PathBuf::from("/data/incoming");
        let key = derive_task_key(&root, Path::new("/elsewhere/deep/slideB.svs")).unwrap();
        assert_eq!(key, "slideB");
    }

    #[test]
    fn test_key_rejects_missing_file_name() {
        let root = PathBuf::from("/data/incoming");
        assert!(derive_task_key(&root, Path::new("/")).is_none());
    }

    #[test]
    fn test_extension_of_is_lowercase() {
        assert_eq!(extension_of(Path::new("a/B.SVS")), Some("svs".to_string()));
        assert_eq!(extension_of(Path::new("a/README")), None);
    }

    #[test]
    fn test_relative_paths_resolve_against_working_directory() {
        let cwd = std::env::current_dir().unwrap();

        let root = resolve_dir(Path::new("not-created-incoming"));
        assert!(root.is_absolute());
        assert_eq!(root, cwd.join("not-created-incoming"));

        let file = resolve_file(Path::new("not-created-incoming/a/slide.svs"));
        assert_eq!(file, cwd.join("not-created-incoming/a/slide.svs"));
    }

    #[test]
    fn test_resolved_paths_keep_keys_distinct() {
        let root = resolve_dir(Path::new("incoming"));
        let a = derive_task_key(&root, &resolve_file(Path::new("incoming/a/slide.svs")));
        let b = derive_task_key(&root, &resolve_file(Path::new("incoming/b/slide.svs")));
        assert_eq!(a.as_deref(), Some("a__slide"));
        assert_eq!(b.as_deref(), Some("b__slide"));
    }

    #[test]
    fn test_resolve_file_canonicalizes_existing_parent() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("case1");
        std::fs::create_dir_all(&nested).unwrap();

        let resolved = resolve_file(&nested.join("../case1/slide.svs"));
        assert_eq!(
            resolved,
            std::fs::canonicalize(&nested).unwrap().join("slide.svs")
        );
    }
}
