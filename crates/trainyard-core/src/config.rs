//! Configuration resolution for Trainyard.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/trainyard/settings.json)
//! 3. Project config (.trainyard/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Programs shipped with the dashboard, allowed to run when no `programs`
/// section is configured.
pub const DEFAULT_PROGRAM_KINDS: [&str; 6] = [
    "run_yolo",
    "collect_images",
    "convert_yolo_to_ls",
    "download_annotated",
    "generate_data_yaml",
    "index_predictions_by_class",
];

/// Complete Trainyard configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Allow-listed programs keyed by job kind. Empty means built-in defaults.
    #[serde(default)]
    pub programs: BTreeMap<String, ProgramConfig>,
    #[serde(default)]
    pub store_retry: RetryConfig,
}

/// Orchestrator-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    /// Directory receiving staged job configs.
    pub staging_dir: Option<PathBuf>,
    /// Directory holding the default Python scripts.
    pub scripts_dir: PathBuf,
    /// Per-stream cap on output kept for the aggregate result and audit log.
    pub max_output_bytes: usize,
    pub max_concurrent_jobs: usize,
    /// Wall-clock limit per job. `None` lets jobs run indefinitely.
    pub job_timeout_secs: Option<u64>,
    /// Seconds between SIGTERM and SIGKILL when a job times out.
    pub terminate_grace_secs: u64,
    /// Capacity of the live subscriber channel.
    pub subscriber_buffer: usize,
    /// Seconds a full subscriber channel may block a job before the
    /// subscriber is detached.
    pub subscriber_stall_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".to_string(),
            staging_dir: None,
            scripts_dir: PathBuf::from("scripts"),
            max_output_bytes: 10 * 1024 * 1024, // 10 MB
            max_concurrent_jobs: 4,
            job_timeout_secs: None,
            terminate_grace_secs: 5,
            subscriber_buffer: 256,
            subscriber_stall_secs: 30,
        }
    }
}

impl DaemonConfig {
    /// Staging directory, defaulting to `<tmp>/trainyard/configs`.
    pub fn staging_dir_or_default(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("trainyard").join("configs"))
    }
}

/// One allow-listed program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Executable path, or a bare name looked up on `PATH`.
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag preceding the staged config path (e.g. `--config`). When unset
    /// the path is passed positionally.
    #[serde(default)]
    pub config_flag: Option<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

/// Retry policy for job state store writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        std::time::Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

impl Config {
    /// Resolved program allow-list: the configured map, or the built-in
    /// Python scripts under `daemon.scripts_dir`.
    pub fn programs_or_default(&self) -> BTreeMap<String, ProgramConfig> {
        if !self.programs.is_empty() {
            return self.programs.clone();
        }

        DEFAULT_PROGRAM_KINDS
            .iter()
            .map(|kind| {
                let script = self.daemon.scripts_dir.join(format!("{kind}.py"));
                let program = ProgramConfig {
                    program: PathBuf::from("python3"),
                    args: vec![script.to_string_lossy().into_owned()],
                    // run_yolo.py parses `--config`; the others read argv[1].
                    config_flag: (*kind == "run_yolo").then(|| "--config".to_string()),
                    working_directory: None,
                };
                ((*kind).to_string(), program)
            })
            .collect()
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    // Load project config
    if let Some(dir) = project_dir {
        let project_path = dir.join(".trainyard").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("trainyard").join("settings.json"))
}

/// Default database path: ~/.trainyard/jobs.db
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".trainyard").join("jobs.db"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.daemon.database_path.is_some() {
        base.daemon.database_path = overlay.daemon.database_path;
    }
    if overlay.daemon.staging_dir.is_some() {
        base.daemon.staging_dir = overlay.daemon.staging_dir;
    }
    if overlay.daemon.job_timeout_secs.is_some() {
        base.daemon.job_timeout_secs = overlay.daemon.job_timeout_secs;
    }
    base.daemon.log_level = overlay.daemon.log_level;
    base.daemon.scripts_dir = overlay.daemon.scripts_dir;
    base.daemon.max_output_bytes = overlay.daemon.max_output_bytes;
    base.daemon.max_concurrent_jobs = overlay.daemon.max_concurrent_jobs;
    base.daemon.terminate_grace_secs = overlay.daemon.terminate_grace_secs;
    base.daemon.subscriber_buffer = overlay.daemon.subscriber_buffer;
    base.daemon.subscriber_stall_secs = overlay.daemon.subscriber_stall_secs;

    // A project may add or replace individual programs.
    base.programs.extend(overlay.programs);

    base.store_retry = overlay.store_retry;
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("TRAINYARD_DB_PATH") {
        config.daemon.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = var("TRAINYARD_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(val) = var("TRAINYARD_STAGING_DIR") {
        config.daemon.staging_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = var("TRAINYARD_SCRIPTS_DIR") {
        config.daemon.scripts_dir = PathBuf::from(val);
    }
    if let Some(n) = var("TRAINYARD_MAX_CONCURRENT_JOBS").and_then(|v| v.parse().ok()) {
        config.daemon.max_concurrent_jobs = n;
    }
    if let Some(n) = var("TRAINYARD_JOB_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.daemon.job_timeout_secs = Some(n);
    }
}
