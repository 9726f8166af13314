//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "broker.toml",
    "./config/broker.toml",
    "/etc/mq/broker.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    search_standard_paths: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_path: None,
            search_standard_paths: true,
        }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
            search_standard_paths: true,
        }
    }

    /// Only consider the explicit path and `MQ_CONFIG`.
    pub fn without_search_paths(mut self) -> Self {
        self.search_standard_paths = false;
        self
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => AppConfig::default(),
        };

        apply_env_overrides(&mut config, |key| env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured path does not exist, falling back to search");
        }

        if let Ok(path) = env::var("MQ_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        if !self.search_standard_paths {
            return None;
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `MQ_*` overrides. The lookup is injected so tests need not touch
/// the process environment.
pub(crate) fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("MQ_BROKER_NAME") {
        config.broker.name = val;
    }
    if let Some(size) = lookup("MQ_GLOBAL_MAX_SIZE").and_then(|v| v.parse().ok()) {
        config.broker.global_max_size = size;
    }
    if let Some(size) = lookup("MQ_ID_CACHE_SIZE").and_then(|v| v.parse().ok()) {
        config.broker.id_cache_size = size;
    }
    if let Some(val) = lookup("MQ_MESSAGE_COUNTER_ENABLED") {
        config.broker.message_counter_enabled = val == "true" || val == "1";
    }
    if let Some(period) = lookup("MQ_MESSAGE_COUNTER_SAMPLE_PERIOD_MS").and_then(|v| v.parse().ok()) {
        config.broker.message_counter_sample_period_ms = period;
    }
    if let Some(days) = lookup("MQ_MESSAGE_COUNTER_MAX_DAY_COUNT").and_then(|v| v.parse().ok()) {
        config.broker.message_counter_max_day_count = days;
    }
    if let Some(val) = lookup("MQ_SCALE_DOWN_CONNECTORS") {
        config.scale_down.connectors = val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
}
