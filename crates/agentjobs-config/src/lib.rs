use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that overrides `database_path`.
pub const DATABASE_ENV: &str = "AGENTJOBS_DB";

/// Upper bound for every `*_secs` setting (ten years).
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
    #[error("Invalid config value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// Due-job polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum jobs leased per tick.
    #[serde(default = "default_pickup_limit")]
    pub pickup_limit: usize,
    /// Seconds between pickup ticks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Jobs executed in parallel within one tick.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_pickup_limit() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    15
}

fn default_concurrency() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pickup_limit: default_pickup_limit(),
            poll_interval_secs: default_poll_interval(),
            concurrency: default_concurrency(),
        }
    }
}

/// Stale run reclamation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// A run still `running` after this many seconds is presumed abandoned.
    /// Must exceed the slowest legitimate job execution.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
}

fn default_stale_after() -> u64 {
    30 * 60
}

fn default_reaper_interval() -> u64 {
    5 * 60
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
            interval_secs: default_reaper_interval(),
        }
    }
}

/// Run history retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_max_runs")]
    pub max_runs_per_job: usize,
    #[serde(default = "default_retention_interval")]
    pub interval_secs: u64,
}

fn default_max_runs() -> usize {
    100
}

fn default_retention_interval() -> u64 {
    60 * 60
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_runs_per_job: default_max_runs(),
            interval_secs: default_retention_interval(),
        }
    }
}

/// Defaults applied to newly created jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_max_failures")]
    pub max_failures: i64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_max_failures() -> i64 {
    agentjobs_types::DEFAULT_MAX_FAILURES
}

fn default_timezone() -> String {
    agentjobs_types::DEFAULT_TIMEZONE.to_string()
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            timezone: default_timezone(),
        }
    }
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// SQLite database file. Defaults to `~/.agentjobs/jobs.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub defaults: JobDefaults,
}

impl SchedulerConfig {
    /// Reject values that would stall or disable the scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 7] = [
            ("worker.pickup_limit", self.worker.pickup_limit > 0),
            ("worker.poll_interval_secs", self.worker.poll_interval_secs > 0),
            ("worker.concurrency", self.worker.concurrency > 0),
            ("reaper.stale_after_secs", self.reaper.stale_after_secs > 0),
            ("reaper.interval_secs", self.reaper.interval_secs > 0),
            ("retention.interval_secs", self.retention.interval_secs > 0),
            ("defaults.max_failures", self.defaults.max_failures > 0),
        ];
        for (field, ok) in checks {
            if !ok {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be greater than 0".to_string(),
                });
            }
        }
        let intervals: [(&'static str, u64); 4] = [
            ("worker.poll_interval_secs", self.worker.poll_interval_secs),
            ("reaper.stale_after_secs", self.reaper.stale_after_secs),
            ("reaper.interval_secs", self.reaper.interval_secs),
            ("retention.interval_secs", self.retention.interval_secs),
        ];
        for (field, secs) in intervals {
            if secs > MAX_INTERVAL_SECS {
                return Err(ConfigError::Invalid {
                    field,
                    message: format!("must be at most {MAX_INTERVAL_SECS}"),
                });
            }
        }
        if self.retention.max_runs_per_job == 0 {
            return Err(ConfigError::Invalid {
                field: "retention.max_runs_per_job",
                message: "must keep at least one run".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve the database path: explicit config, then `~/.agentjobs/jobs.db`.
    pub fn resolve_database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("jobs.db")),
        }
    }
}

/// Resolve the config directory (~/.agentjobs/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".agentjobs"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.agentjobs/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<SchedulerConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    let mut config = load_config_from(&path)?;
    if let Ok(db) = std::env::var(DATABASE_ENV) {
        if !db.trim().is_empty() {
            config.database_path = Some(PathBuf::from(db));
        }
    }
    config.validate()?;
    Ok(config)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<SchedulerConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(SchedulerConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: SchedulerConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Save configuration to a specific path.
pub fn save_config_to(config: &SchedulerConfig, path: &Path) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Save configuration to the default path.
pub fn save_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    save_config_to(config, &dir.join("config.json5"))
}
