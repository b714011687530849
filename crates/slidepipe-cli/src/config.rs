//! Settings loading and command-line overrides.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use slidepipe_lib::{Settings, SettingsManager};

/// Flags shared by `watch` and `convert`
#[derive(Debug, Clone, Default, Args)]
pub struct SettingsArgs {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory watched for new slides
    #[arg(long, value_name = "DIR")]
    pub watch_root: Option<PathBuf>,

    /// Directory receiving converted pyramids
    #[arg(long, value_name = "DIR")]
    pub output_root: Option<PathBuf>,

    /// Directory for intermediate artifacts
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Maximum number of conversions running at once
    #[arg(long, value_name = "N")]
    pub max_concurrency: Option<usize>,

    /// Retries after the first failed attempt
    #[arg(long, value_name = "N")]
    pub max_retries: Option<u32>,

    /// Delegate conversions to a remote service at this base URL
    #[arg(long, value_name = "URL")]
    pub remote_url: Option<String>,

    /// Also write daily-rolling log files into this directory
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Print every event as a JSON line on stdout
    #[arg(long)]
    pub json_events: bool,
}

impl SettingsArgs {
    /// Loads the settings file and applies the overrides.
    ///
    /// An explicit `--config` must be readable. The default location falls
    /// back to built-in defaults.
    pub fn load(&self) -> anyhow::Result<Settings> {
        let settings = match &self.config {
            Some(path) => SettingsManager::with_path(path.clone())
                .try_load()
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => SettingsManager::default_location()
                .map(|manager| manager.load())
                .unwrap_or_default(),
        };
        Ok(self.apply(settings))
    }

    pub fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(root) = &self.watch_root {
            settings.watch.watch_root = root.clone();
        }
        if let Some(root) = &self.output_root {
            settings.output.output_root = root.clone();
        }
        if let Some(dir) = &self.work_dir {
            settings.output.work_dir = dir.clone();
        }
        if let Some(n) = self.max_concurrency {
            settings.workers.max_concurrency = n;
        }
        if let Some(n) = self.max_retries {
            settings.workers.max_retries = n;
        }
        if let Some(url) = &self.remote_url {
            settings.remote.enabled = true;
            settings.remote.base_url = Some(url.clone());
        }

        settings.normalize();
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_overrides_apply_on_top_of_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let mut stored = Settings::default();
        stored.workers.max_retries = 7;
        stored.output.output_root = dir.path().join("from-file");
        SettingsManager::with_path(path.clone()).save(&stored).unwrap();

        let args = SettingsArgs {
            config: Some(path),
            watch_root: Some(dir.path().join("in")),
            max_concurrency: Some(3),
            ..Default::default()
        };
        let settings = args.load().unwrap();

        assert_eq!(settings.watch.watch_root, dir.path().join("in"));
        assert_eq!(settings.output.output_root, dir.path().join("from-file"));
        assert_eq!(settings.workers.max_concurrency, 3);
        assert_eq!(settings.workers.max_retries, 7);
    }

    #[test]
    fn test_remote_url_enables_delegation() {
        let args = SettingsArgs {
            remote_url: Some("http://tiler.local/api".to_string()),
            ..Default::default()
        };
        let settings = args.apply(Settings::default());
        assert!(settings.remote.enabled);
        assert_eq!(
            settings.remote.base_url.as_deref(),
            Some("http://tiler.local/api")
        );
    }

    #[test]
    fn test_unreadable_explicit_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let args = SettingsArgs {
            config: Some(path),
            ..Default::default()
        };
        assert!(args.load().is_err());
    }
}
