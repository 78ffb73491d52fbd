use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Scheduler configuration.
///
/// All durations are in milliseconds. The read timeout bounds how long
/// `status`/`list` wait for the store lock before answering from cache, so it
/// must stay well below `lock_timeout_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronConfig {
    /// Whether the background timer runs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Explicit store file. Derived from the agent scope when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<PathBuf>,
    /// How long mutations wait for the store lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Age after which a lock file is considered abandoned.
    #[serde(default = "default_stale_lock_ms")]
    pub stale_lock_ms: u64,
    /// How long reads wait for the store lock.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Catch-up tick interval.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Run logs larger than this are pruned.
    #[serde(default = "default_run_log_max_bytes")]
    pub run_log_max_bytes: u64,
    /// Entries kept when a run log is pruned.
    #[serde(default = "default_run_log_keep_lines")]
    pub run_log_keep_lines: usize,
}

fn default_true() -> bool {
    true
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_stale_lock_ms() -> u64 {
    30_000
}

fn default_read_timeout_ms() -> u64 {
    1_000
}

fn default_tick_interval_ms() -> u64 {
    10_000
}

fn default_run_log_max_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_run_log_keep_lines() -> usize {
    2_000
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            stale_lock_ms: default_stale_lock_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            run_log_max_bytes: default_run_log_max_bytes(),
            run_log_keep_lines: default_run_log_keep_lines(),
        }
    }
}

/// Top-level chime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChimeConfig {
    /// Agent whose store is used when no scope is given.
    #[serde(default = "default_agent_name")]
    pub default_agent: String,
    /// Scheduler settings.
    #[serde(default)]
    pub cron: CronConfig,
}

fn default_agent_name() -> String {
    "default".to_string()
}

impl Default for ChimeConfig {
    fn default() -> Self {
        Self {
            default_agent: default_agent_name(),
            cron: CronConfig::default(),
        }
    }
}

/// Resolve the chime config directory (~/.chime/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".chime"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.chime/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<ChimeConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<ChimeConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(ChimeConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: ChimeConfig = json5::from_str(&content)?;
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

/// Save configuration to the default path.
pub fn save_config(config: &ChimeConfig) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    let path = dir.join("config.json5");
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Resolve the job store file for an agent scope.
///
/// An explicit `cron.store` wins. Otherwise each agent gets its own store at
/// `~/.chime/cron/<agent>/jobs.json`, so independent schedulers never share
/// a lock file by accident.
pub fn resolve_cron_store_path(
    config: &ChimeConfig,
    agent_id: Option<&str>,
) -> Result<PathBuf, ConfigError> {
    if let Some(store) = &config.cron.store {
        return Ok(store.clone());
    }
    let agent = agent_id
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or(&config.default_agent);
    Ok(config_dir()?
        .join("cron")
        .join(sanitize_scope(agent))
        .join("jobs.json"))
}

/// Keep agent ids from escaping the cron directory.
fn sanitize_scope(scope: &str) -> String {
    scope
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
