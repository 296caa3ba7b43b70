use std::path::{Path, PathBuf};
use std::time::Duration;

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

/// Agent loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Model ID passed to the provider (e.g. "anthropic/claude-sonnet-4").
    #[serde(default = "default_model")]
    pub model: String,
    /// Optional system prompt prepended to every provider request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Maximum provider rounds per processing call.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// Per tool call timeout.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Per provider call timeout.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    /// How long `run` waits for in-flight sessions on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4".to_string()
}

fn default_max_tool_iterations() -> usize {
    20
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_provider_timeout_secs() -> u64 {
    120
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl AgentSettings {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            system_prompt: None,
            max_tool_iterations: default_max_tool_iterations(),
            tool_timeout_secs: default_tool_timeout_secs(),
            provider_timeout_secs: default_provider_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Message bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Pending envelopes kept per subscriber before the oldest is dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Cron scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSettings {
    /// Tick resolution of the scheduler loop.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    /// Upper bound on jobs executing at the same time.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Job store location (defaults to `<workspace>/cron/jobs.json`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    /// Jobs upserted by name every time the gateway starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<SeedJob>,
}

/// A job declared in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedJob {
    pub name: String,
    pub message: String,
    /// Interval schedule, in seconds. Exclusive with `cron_expr`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_seconds: Option<u64>,
    /// Cron expression. Exclusive with `every_seconds`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub deliver: bool,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub to: String,
}

fn default_tick_millis() -> u64 {
    1000
}

fn default_max_concurrent_jobs() -> usize {
    4
}

impl CronSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            tick_millis: default_tick_millis(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            store_path: None,
            jobs: Vec::new(),
        }
    }
}

/// Top-level clawgate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClawgateConfig {
    /// Workspace directory (defaults to `~/.clawgate/workspace`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub cron: CronSettings,
}

impl ClawgateConfig {
    /// Resolve the workspace directory.
    pub fn workspace_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.workspace {
            Some(dir) => Ok(dir.clone()),
            None => Ok(config_dir()?.join("workspace")),
        }
    }

    /// Resolve the cron job store file.
    pub fn cron_store_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.cron.store_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.workspace_path()?.join("cron").join("jobs.json")),
        }
    }
}

/// Resolve the clawgate config directory (~/.clawgate/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".clawgate"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.clawgate/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<ClawgateConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<ClawgateConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(ClawgateConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: ClawgateConfig = json5::from_str(&content)?;
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
