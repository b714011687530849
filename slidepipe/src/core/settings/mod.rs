//! Settings Persistence System
//!
//! Provides persistent service settings with:
//! - Atomic file writes (temp file + rename)
//! - Schema validation with defaults
//! - Normalization of out-of-range values instead of hard failures
//!
//! Storage location: {config_dir}/slidepipe/settings.json unless a path is given.

use serde::{Deserialize, Serialize};
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::core::{resolve_dir, CoreError, CoreResult};

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

/// Lock file name (advisory lock to prevent concurrent writers)
pub const SETTINGS_LOCK_FILE: &str = "settings.json.lock";

/// Whole-slide formats accepted by default.
pub const DEFAULT_SUPPORTED_EXTENSIONS: &[&str] = &[
    "svs", "ndpi", "scn", "mrxs", "vms", "vmu", "bif", "tif", "tiff", "czi", "qptiff", "svslide",
];

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory watching and admission
    #[serde(default)]
    pub watch: WatchSettings,

    /// Output locations
    #[serde(default)]
    pub output: OutputSettings,

    /// Worker pool and retry policy
    #[serde(default)]
    pub workers: WorkerSettings,

    /// External tool invocations
    #[serde(default)]
    pub tools: ToolSettings,

    /// Remote delegation
    #[serde(default)]
    pub remote: RemoteSettings,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            watch: WatchSettings::default(),
            output: OutputSettings::default(),
            workers: WorkerSettings::default(),
            tools: ToolSettings::default(),
            remote: RemoteSettings::default(),
        }
    }
}

impl Settings {
    /// Clamp and sanitize values so the service never starts with a broken configuration.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;

        self.watch.stability_window_ms = self.watch.stability_window_ms.clamp(100, 3_600_000);
        self.watch.poll_interval_ms = self.watch.poll_interval_ms.clamp(50, 60_000);
        self.watch.min_file_age_ms = self.watch.min_file_age_ms.min(3_600_000);
        self.watch.recheck_delay_ms = self.watch.recheck_delay_ms.clamp(100, 3_600_000);
        self.watch.supported_extensions = normalize_extensions(&self.watch.supported_extensions);

        self.output.output_extension =
            normalize_extension(&self.output.output_extension).unwrap_or_else(default_output_extension);
        self.output.intermediate_extension = normalize_extension(&self.output.intermediate_extension)
            .unwrap_or_else(default_intermediate_extension);

        self.workers.max_concurrency = self.workers.max_concurrency.clamp(1, 64);
        self.workers.max_retries = self.workers.max_retries.min(20);
        self.workers.retry_delay_ms = self.workers.retry_delay_ms.min(3_600_000);
        if self.workers.thread_budget == 0 {
            self.workers.thread_budget = default_thread_budget();
        }
        self.workers.termination_grace_ms = self.workers.termination_grace_ms.clamp(100, 60_000);
        self.workers.progress_interval_ms = self.workers.progress_interval_ms.min(60_000);
        if self.workers.max_runtime_secs == Some(0) {
            self.workers.max_runtime_secs = None;
        }
        self.workers.history_limit = self.workers.history_limit.clamp(1, 10_000);
        self.workers.event_buffer = self.workers.event_buffer.clamp(16, 65_536);
        if self.workers.stale_after_secs == 0 {
            self.workers.stale_after_secs = default_stale_after_secs();
        }
        self.workers.stale_check_interval_secs = self.workers.stale_check_interval_secs.clamp(1, 86_400);

        if self.tools.transform.program.trim().is_empty() {
            self.tools.transform = default_transform_command();
        }
        if self.tools.tile.program.trim().is_empty() {
            self.tools.tile = default_tile_command();
        }
        if matches!(&self.tools.metadata, Some(cmd) if cmd.program.trim().is_empty()) {
            self.tools.metadata = None;
        }
        if self.tools.thread_env_var.trim().is_empty() {
            self.tools.thread_env_var = default_thread_env_var();
        }

        self.remote.base_url = self
            .remote
            .base_url
            .take()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());
        if self.remote.enabled && self.remote.base_url.is_none() {
            warn!("Remote delegation enabled without a base URL, disabling");
            self.remote.enabled = false;
        }
        self.remote.poll_interval_ms = self.remote.poll_interval_ms.clamp(100, 600_000);
        self.remote.request_timeout_secs = self.remote.request_timeout_secs.clamp(1, 600);
        self.remote.max_poll_failures = self.remote.max_poll_failures.max(1);
    }

    /// Makes the watch root, output root and work directory absolute.
    ///
    /// Kept out of `normalize` so saved files keep the paths the user wrote.
    pub fn resolve_paths(&mut self) {
        self.watch.watch_root = resolve_dir(&self.watch.watch_root);
        self.output.output_root = resolve_dir(&self.output.output_root);
        self.output.work_dir = resolve_dir(&self.output.work_dir);
    }

    /// Checks relationships between paths that normalization cannot repair.
    pub fn validate(&self) -> CoreResult<()> {
        let watch_root = resolve_dir(&self.watch.watch_root);
        if resolve_dir(&self.output.output_root) == watch_root {
            return Err(CoreError::InvalidSettings(
                "output root must differ from the watch root".to_string(),
            ));
        }
        if resolve_dir(&self.output.work_dir) == watch_root {
            return Err(CoreError::InvalidSettings(
                "work directory must differ from the watch root".to_string(),
            ));
        }
        Ok(())
    }

    /// Threads handed to each pipeline: `max(1, threadBudget / maxConcurrency)`.
    pub fn threads_per_pipeline(&self) -> usize {
        (self.workers.thread_budget / self.workers.max_concurrency.max(1)).max(1)
    }
}

fn normalize_extension(value: &str) -> Option<String> {
    let ext = value.trim().trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}

fn normalize_extensions(values: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(values.len());
    for ext in values.iter().filter_map(|v| normalize_extension(v)) {
        if !normalized.contains(&ext) {
            normalized.push(ext);
        }
    }
    if normalized.is_empty() {
        default_supported_extensions()
    } else {
        normalized
    }
}

// ============================================================
// Watch Settings
// ============================================================

/// Directory watching and admission settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatchSettings {
    /// Directory observed for new slides
    #[serde(default = "default_watch_root")]
    pub watch_root: PathBuf,

    /// Size and mtime must stay unchanged this long before a file is reported
    #[serde(default = "default_stability_window_ms")]
    pub stability_window_ms: u64,

    /// How often pending files are re-checked for stability
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Files modified more recently than this are deferred by the admission gate
    #[serde(default = "default_min_file_age_ms")]
    pub min_file_age_ms: u64,

    /// Delay before a deferred file is re-evaluated
    #[serde(default = "default_recheck_delay_ms")]
    pub recheck_delay_ms: u64,

    /// Lowercase extensions (without dot) that are converted
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,

    /// Enumerate pre-existing files on startup
    #[serde(default = "default_true")]
    pub scan_on_start: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            watch_root: default_watch_root(),
            stability_window_ms: default_stability_window_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            min_file_age_ms: default_min_file_age_ms(),
            recheck_delay_ms: default_recheck_delay_ms(),
            supported_extensions: default_supported_extensions(),
            scan_on_start: true,
        }
    }
}

impl WatchSettings {
    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn min_file_age(&self) -> Duration {
        Duration::from_millis(self.min_file_age_ms)
    }

    pub fn recheck_delay(&self) -> Duration {
        Duration::from_millis(self.recheck_delay_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_watch_root() -> PathBuf {
    PathBuf::from("incoming")
}

fn default_stability_window_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_min_file_age_ms() -> u64 {
    3_000
}

fn default_recheck_delay_ms() -> u64 {
    3_000
}

fn default_supported_extensions() -> Vec<String> {
    DEFAULT_SUPPORTED_EXTENSIONS
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

// ============================================================
// Output Settings
// ============================================================

/// Output location settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputSettings {
    /// Directory receiving tiled pyramids
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Directory holding intermediate artifacts
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Extension of the finished artifact, used to detect already-converted slides
    #[serde(default = "default_output_extension")]
    pub output_extension: String,

    /// Extension of the transform-stage intermediate
    #[serde(default = "default_intermediate_extension")]
    pub intermediate_extension: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            work_dir: default_work_dir(),
            output_extension: default_output_extension(),
            intermediate_extension: default_intermediate_extension(),
        }
    }
}

impl OutputSettings {
    /// Base path (without extension) handed to the tile command.
    pub fn output_base(&self, task_key: &str) -> PathBuf {
        self.output_root.join(task_key)
    }

    /// Finished artifact whose presence marks a slide as converted.
    pub fn output_artifact(&self, task_key: &str) -> PathBuf {
        self.output_root
            .join(format!("{}.{}", task_key, self.output_extension))
    }
}

fn default_output_root() -> PathBuf {
    PathBuf::from("converted")
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("slidepipe")
}

fn default_output_extension() -> String {
    "dzi".to_string()
}

fn default_intermediate_extension() -> String {
    "tif".to_string()
}

// ============================================================
// Worker Settings
// ============================================================

/// Worker pool, retry and supervision settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSettings {
    /// Maximum pipelines running at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay before a failed task is re-queued
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Threads shared by all running pipelines (0 = detected CPU count)
    #[serde(default = "default_thread_budget")]
    pub thread_budget: usize,

    /// Time a signalled child gets to exit before it is killed
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,

    /// Minimum spacing between progress events within a phase
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Per-attempt watchdog (None = unlimited)
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,

    /// Terminal task statuses kept for `status` lookups
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Capacity of each event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Queued tasks older than this are reported as stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// How often the stale check runs
    #[serde(default = "default_stale_check_interval_secs")]
    pub stale_check_interval_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            thread_budget: default_thread_budget(),
            termination_grace_ms: default_termination_grace_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            max_runtime_secs: None,
            history_limit: default_history_limit(),
            event_buffer: default_event_buffer(),
            stale_after_secs: default_stale_after_secs(),
            stale_check_interval_secs: default_stale_check_interval_secs(),
        }
    }
}

impl WorkerSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_secs.map(Duration::from_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_secs(self.stale_check_interval_secs)
    }
}

fn default_max_concurrency() -> usize {
    2
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_thread_budget() -> usize {
    num_cpus::get().max(1)
}

fn default_termination_grace_ms() -> u64 {
    2_000
}

fn default_progress_interval_ms() -> u64 {
    1_000
}

fn default_history_limit() -> usize {
    200
}

fn default_event_buffer() -> usize {
    1024
}

fn default_stale_after_secs() -> u64 {
    3_600
}

fn default_stale_check_interval_secs() -> u64 {
    300
}

// ============================================================
// Tool Settings
// ============================================================

/// An external command with `{input}`, `{output}` and `{threads}` placeholders
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    /// Substitutes placeholders in every argument.
    pub fn render_args(&self, input: &Path, output: &Path, threads: usize) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        let threads = threads.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{threads}", &threads)
            })
            .collect()
    }
}

/// External tool settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSettings {
    /// Stage 1: color transform into the intermediate artifact
    #[serde(default = "default_transform_command")]
    pub transform: ToolCommand,

    /// Stage 2: pyramid tiling of the intermediate
    #[serde(default = "default_tile_command")]
    pub tile: ToolCommand,

    /// Optional metadata extraction run after tiling
    #[serde(default)]
    pub metadata: Option<ToolCommand>,

    /// Environment variable receiving the per-pipeline thread count
    #[serde(default = "default_thread_env_var")]
    pub thread_env_var: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            transform: default_transform_command(),
            tile: default_tile_command(),
            metadata: None,
            thread_env_var: default_thread_env_var(),
        }
    }
}

fn default_transform_command() -> ToolCommand {
    ToolCommand::new(
        "vips",
        &["icc_transform", "{input}", "{output}", "srgb", "--vips-progress"],
    )
}

fn default_tile_command() -> ToolCommand {
    ToolCommand::new("vips", &["dzsave", "{input}", "{output}", "--vips-progress"])
}

fn default_thread_env_var() -> String {
    "VIPS_CONCURRENCY".to_string()
}

// ============================================================
// Remote Settings
// ============================================================

/// Remote delegation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSettings {
    /// Forward conversions to a remote service instead of running them locally
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the conversion service, e.g. `https://tiler.lab.local/api`
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token sent with every request
    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_remote_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Consecutive poll failures tolerated before the attempt fails
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            api_token: None,
            poll_interval_ms: default_remote_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_poll_failures: default_max_poll_failures(),
        }
    }
}

impl RemoteSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_remote_poll_interval_ms() -> u64 {
    2_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_poll_failures() -> u32 {
    5
}

// ============================================================
// Settings Manager
// ============================================================

/// Settings manager for loading and saving settings
pub struct SettingsManager {
    settings_path: PathBuf,
}

impl SettingsManager {
    /// Create a settings manager storing `settings.json` in the given directory
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            settings_path: config_dir.join(SETTINGS_FILE),
        }
    }

    /// Create a settings manager for an explicit settings file
    pub fn with_path(settings_path: PathBuf) -> Self {
        Self { settings_path }
    }

    /// Per-user default location, `{config_dir}/slidepipe/settings.json`
    pub fn default_location() -> Option<Self> {
        dirs::config_dir().map(|dir| Self::new(dir.join("slidepipe")))
    }

    fn lock_path(&self) -> PathBuf {
        let file_name = self
            .settings_path
            .file_name()
            .map(|name| format!("{}.lock", name.to_string_lossy()))
            .unwrap_or_else(|| SETTINGS_LOCK_FILE.to_string());
        self.settings_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(file_name)
    }

    fn with_lock<T>(&self, exclusive: bool, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        // Ensure parent directory exists so the lock file can be created.
        if let Some(parent) = self.settings_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file)?;
        } else {
            fs2::FileExt::lock_shared(&lock_file)?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock settings lock file: {}", e);
        }

        result
    }

    /// Get the settings file path
    pub fn settings_path(&self) -> &PathBuf {
        &self.settings_path
    }

    /// Load settings from disk, returning defaults if the file is missing or unreadable
    pub fn load(&self) -> Settings {
        match self.try_load() {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load settings, using defaults: {}", e);
                Settings::default()
            }
        }
    }

    /// Load settings from disk, surfacing read and parse errors
    pub fn try_load(&self) -> CoreResult<Settings> {
        self.with_lock(false, || {
            if !self.settings_path.exists() {
                info!("Settings file not found, using defaults");
                return Ok(Settings::default());
            }

            let content = fs::read_to_string(&self.settings_path)?;
            let mut settings = serde_json::from_str::<Settings>(&content)?;

            if settings.version < SETTINGS_VERSION {
                info!(
                    "Migrating settings from version {} to {}",
                    settings.version, SETTINGS_VERSION
                );
            }

            settings.normalize();
            Ok(settings)
        })
    }

    /// Save settings to disk using atomic write (temp file + rename)
    pub fn save(&self, settings: &Settings) -> CoreResult<Settings> {
        self.with_lock(true, || {
            let mut normalized = settings.clone();
            normalized.normalize();

            let content = serde_json::to_string_pretty(&normalized)?;

            let temp_path = self.settings_path.with_extension("json.tmp");
            if temp_path.exists() {
                let _ = fs::remove_file(&temp_path);
            }

            let mut file = fs::File::create(&temp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;

            if cfg!(windows) {
                // Windows: rename does not overwrite, so we use a backup-then-swap.
                let backup_path = self.settings_path.with_extension("json.bak");
                if backup_path.exists() {
                    let _ = fs::remove_file(&backup_path);
                }

                if self.settings_path.exists() {
                    fs::rename(&self.settings_path, &backup_path)?;
                }

                if let Err(e) = fs::rename(&temp_path, &self.settings_path) {
                    if backup_path.exists() {
                        let _ = fs::rename(&backup_path, &self.settings_path);
                    }
                    return Err(e.into());
                }
                if backup_path.exists() {
                    let _ = fs::remove_file(&backup_path);
                }
            } else {
                fs::rename(&temp_path, &self.settings_path)?;
            }

            info!("Settings saved to {:?}", self.settings_path);
            Ok(normalized)
        })
    }
}
