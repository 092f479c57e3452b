use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::task::{DEFAULT_MAX_RETRIES, Team};

/// Default cadence for poll-based subscriptions.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Log level for the engine and any embedding process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Off,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("invalid config: {0}")]
  Toml(#[from] toml::de::Error),
  #[error("teams must not be empty")]
  NoTeams,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Effective configuration after merging a config file over defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
  /// Workspace directory owned by this process.
  pub root: PathBuf,
  /// Teams to lay inboxes out for.
  pub teams: Vec<Team>,
  /// Polling cadence for subscriptions that poll (milliseconds).
  pub poll_interval_ms: u64,
  /// Retry budget applied to tasks published without an explicit one.
  pub default_max_retries: u32,
  pub log_level: LogLevel,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      root: PathBuf::from(".agent-workspace"),
      teams: Team::all(),
      poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
      default_max_retries: DEFAULT_MAX_RETRIES,
      log_level: LogLevel::Info,
    }
  }
}

impl Config {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  /// Path of the JSON log file, kept inside the workspace metrics dir.
  pub fn logs_path(&self) -> PathBuf {
    self.root.join("metrics").join("queue.log.jsonl")
  }
}

/// Location of the project config file relative to a project root.
pub fn config_path(project_root: &Path) -> PathBuf {
  project_root.join("courier.toml")
}

/// Load configuration: file values (if the file exists) override defaults.
pub fn load(project_root: Option<&Path>) -> Result<Config> {
  let mut cfg = Config::default();
  if let Some(root) = project_root {
    let path = config_path(root);
    match fs::read_to_string(&path) {
      Ok(s) => {
        let partial: PartialConfig = toml::from_str(&s)?;
        cfg = partial.merge_over(cfg);
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(source) => return Err(ConfigError::Read { path, source }),
    }
  }
  if cfg.teams.is_empty() {
    return Err(ConfigError::NoTeams);
  }
  Ok(cfg)
}

/// File shape: every field optional; missing means keep the base value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
struct PartialConfig {
  root: Option<PathBuf>,
  teams: Option<Vec<Team>>,
  poll_interval_ms: Option<u64>,
  default_max_retries: Option<u32>,
  log_level: Option<LogLevel>,
}

impl PartialConfig {
  fn merge_over(self, base: Config) -> Config {
    Config {
      root: self.root.unwrap_or(base.root),
      teams: self.teams.unwrap_or(base.teams),
      poll_interval_ms: self.poll_interval_ms.unwrap_or(base.poll_interval_ms),
      default_max_retries: self.default_max_retries.unwrap_or(base.default_max_retries),
      log_level: self.log_level.unwrap_or(base.log_level),
    }
  }
}
