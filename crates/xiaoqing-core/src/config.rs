use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Result, anyhow};

use crate::history::DEFAULT_MAX_TURNS;

pub const DEFAULT_BASE_URL: &str = "http://47.97.48.127/api/";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub retry_count: u32,
    pub max_history_turns: usize,
    pub turn_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_empty_reads: u32,
    pub connect_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub fragment_batch: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            retry_count: 2,
            max_history_turns: DEFAULT_MAX_TURNS,
            turn_timeout_secs: 180,
            idle_timeout_secs: 15,
            max_empty_reads: 3,
            connect_timeout_secs: 15,
            response_timeout_secs: 120,
            fragment_batch: 1,
            log_level: "info".to_string(),
        }
    }

    /// Loads the user's config file (defaults when it does not exist yet) and
    /// applies environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(config_path)?;
        let config: Config = serde_json::from_str(&config_content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(config_path, config_content)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("XIAOQING_BASE_URL") {
            if !url.trim().is_empty() {
                self.base_url = url;
            }
        }
        if let Ok(level) = std::env::var("XIAOQING_LOG") {
            if !level.trim().is_empty() {
                self.log_level = level;
            }
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            base_url: self.base_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            turn_timeout: Duration::from_secs(self.turn_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_empty_reads: self.max_empty_reads.max(1),
            fragment_batch: self.fragment_batch.max(1),
            retry: RetryPolicy {
                retry_count: self.retry_count,
                ..RetryPolicy::default()
            },
        }
    }

    /// Directory holding `config.json` and `session.json`.
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("xiaoqing"))
    }

    fn get_config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }
}

/// How many times a chat turn is resubmitted and how long to wait first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_count: u32,
    /// After a read/parse failure, a transport failure or an empty body.
    pub io_delay: Duration,
    /// After a 5xx response.
    pub server_error_delay: Duration,
    /// After the request timed out without any response.
    pub timeout_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 2,
            io_delay: Duration::from_secs(1),
            server_error_delay: Duration::from_secs(2),
            timeout_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    /// How long to wait for the response head once the request is sent.
    pub response_timeout: Duration,
    /// Longest the body may stay silent overall; reaching it ends the stream
    /// normally. Every chunk that arrives restarts it.
    pub turn_timeout: Duration,
    /// Silence after which one empty read is counted.
    pub idle_timeout: Duration,
    /// Consecutive empty reads that end the stream.
    pub max_empty_reads: u32,
    /// Characters coalesced into one fragment; a newline always flushes.
    pub fragment_batch: usize,
    pub retry: RetryPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Config::new().transport_config()
    }
}
