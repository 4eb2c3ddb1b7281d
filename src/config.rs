// src/config.rs

//! Configuration for `evq-watch` and default sizing for callers that want it.
//!
//! Every struct is `#[serde(default)]`, so a config file only needs to name
//! the settings it changes. The file is JSON; its path comes from the
//! `EVQ_CONFIG` environment variable.

use crate::changes::{parse_changelist, ChangeSpec};
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "EVQ_CONFIG";

/// Loaded on first use. A config file that exists but cannot be parsed is a
/// hard error rather than a silent fallback to defaults.
pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().unwrap_or_else(|e| panic!("Failed to load configuration: {:#}", e)));

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Wait sizing and timeout.
    pub poll: PollConfig,
    /// `env_logger` filter used when `RUST_LOG` is not set.
    pub log_filter: LogFilter,
    /// Changelist registered at startup, decoded with [`parse_changelist`].
    pub watches: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Upper bound on results returned by one wait.
    pub max_events: usize,
    /// Passed to the legacy `epoll_create(size)`; must be positive.
    pub size_hint: i32,
    /// Milliseconds; negative blocks until something is ready.
    pub timeout_ms: i64,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            max_events: 64,
            size_hint: 64,
            timeout_ms: -1,
        }
    }
}

impl PollConfig {
    pub fn timeout(&self) -> Option<Duration> {
        crate::timeout::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct LogFilter(pub String);

impl Default for LogFilter {
    fn default() -> Self {
        LogFilter("info".to_string())
    }
}

impl Config {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(text).context("Configuration is not valid JSON")?;
        // Surface a malformed changelist now rather than at registration.
        config.watch_list()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Reads the file named by `EVQ_CONFIG`, or returns defaults if unset.
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::from_path(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// The configured watches; stdin readable when none are configured.
    pub fn watch_list(&self) -> crate::Result<Vec<ChangeSpec>> {
        let watches = parse_changelist(&self.watches)?;
        if watches.is_empty() {
            return Ok(vec![ChangeSpec::readable(libc::STDIN_FILENO as usize)]);
        }
        Ok(watches)
    }
}
