//! Intermediate artifact guard.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Transform-stage output in the work directory.
///
/// The file is deleted when the guard is dropped, so it disappears on every
/// exit path including unwinding.
#[derive(Debug)]
pub struct IntermediateArtifact {
    path: Option<PathBuf>,
}

impl IntermediateArtifact {
    /// Reserves a unique path for one attempt of `task_key`.
    pub fn new(work_dir: &Path, task_key: &str, extension: &str) -> Self {
        let name = format!("{}-{}.{}", task_key, uuid::Uuid::new_v4(), extension);
        Self {
            path: Some(work_dir.join(name)),
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Deletes the artifact now instead of at drop.
    pub async fn remove(mut self) -> io::Result<()> {
        match self.path.take() {
            Some(path) => remove_path(&path).await,
            None => Ok(()),
        }
    }
}

async fn remove_path(path: &Path) -> io::Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            debug!(path = %path.display(), "Removed intermediate artifact");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl Drop for IntermediateArtifact {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove intermediate artifact");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unique_paths_per_attempt() {
        let dir = TempDir::new().unwrap();
        let a = IntermediateArtifact::new(dir.path(), "slideA", "tif");
        let b = IntermediateArtifact::new(dir.path(), "slideA", "tif");

        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(dir.path()));
        assert_eq!(a.path().extension().unwrap(), "tif");
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = TempDir::new().unwrap();
        let artifact = IntermediateArtifact::new(dir.path(), "slideA", "tif");
        std::fs::write(artifact.path(), b"pixels").unwrap();
        let path = artifact.path().to_path_buf();

        drop(artifact);
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_without_file_is_silent() {
        let dir = TempDir::new().unwrap();
        drop(IntermediateArtifact::new(dir.path(), "slideA", "tif"));
    }

    #[tokio::test]
    async fn test_explicit_remove() {
        let dir = TempDir::new().unwrap();
        let artifact = IntermediateArtifact::new(dir.path(), "slideA", "v");
        std::fs::create_dir_all(artifact.path()).unwrap();
        let path = artifact.path().to_path_buf();

        artifact.remove().await.unwrap();
        assert!(!path.exists());
    }
}
