// ABOUTME: Engine configuration - task root, log location, and timing knobs.
// ABOUTME: Loaded from defaults, environment variables, or a JSON file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::ConfigError;

/// Default age after which a lock file is considered abandoned.
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Default inactivity window after which a connection is swept.
pub const DEFAULT_CONNECTION_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Configuration for a task coordination engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the task store; each agent owns `<task_root>/<agent>/`.
    pub task_root: PathBuf,

    /// Newline-delimited JSON operation log.
    pub log_file: PathBuf,

    #[serde(with = "humantime_serde")]
    pub lock_stale_after: Duration,

    #[serde(with = "humantime_serde")]
    pub connection_stale_after: Duration,

    /// How many times a contended task lock is retried before giving up.
    pub lock_retry_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub lock_retry_delay: Duration,

    /// Minimum length of a completion summary.
    pub min_summary_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_root: PathBuf::from("tasks"),
            log_file: PathBuf::from("logs").join("operations.jsonl"),
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
            connection_stale_after: DEFAULT_CONNECTION_STALE_AFTER,
            lock_retry_attempts: 5,
            lock_retry_delay: Duration::from_millis(50),
            min_summary_len: 10,
        }
    }
}

impl EngineConfig {
    /// Create a config rooted at `task_root` with every other value defaulted.
    pub fn with_root(task_root: impl Into<PathBuf>) -> Self {
        Self {
            task_root: task_root.into(),
            ..Self::default()
        }
    }

    /// Build a config from defaults overridden by `TASKMUX_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Apply overrides from a variable lookup function.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("TASKMUX_TASK_ROOT") {
            self.task_root = PathBuf::from(root);
        }
        if let Some(file) = lookup("TASKMUX_LOG_FILE") {
            self.log_file = PathBuf::from(file);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "TASKMUX_LOCK_STALE_SECS")? {
            self.lock_stale_after = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "TASKMUX_CONNECTION_STALE_SECS")? {
            self.connection_stale_after = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, "TASKMUX_LOCK_RETRY_ATTEMPTS")? {
            self.lock_retry_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TASKMUX_LOCK_RETRY_DELAY_MS")? {
            self.lock_retry_delay = Duration::from_millis(ms);
        }
        Ok(self)
    }
}

/// True if `seen` is more than `window` before `now`. Future timestamps are never stale.
pub(crate) fn is_stale(now: DateTime<Utc>, seen: DateTime<Utc>, window: Duration) -> bool {
    (now - seen)
        .to_std()
        .map(|age| age > window)
        .unwrap_or(false)
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}
