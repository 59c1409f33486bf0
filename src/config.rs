// Configuration File Support
//
// This module provides configuration file parsing for the toolwarden broker.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from XDG config directory: ~/.config/toolwarden/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Data directory for persisted stores (history, tasks)
    pub data_dir: PathBuf,

    /// Audit log configuration
    pub audit: AuditConfig,

    /// Execution history configuration
    pub history: HistoryConfig,

    /// Rate limiter configuration
    pub rate_limit: RateLimitConfig,

    /// Subprocess executor configuration
    pub executor: ExecutorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            data_dir: default_data_dir(),
            audit: AuditConfig::default(),
            history: HistoryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    /// Path to the active audit log file
    pub file: PathBuf,

    /// Rotate once the active file exceeds this size in bytes
    pub max_size_bytes: u64,

    /// Number of rotated generations to keep (file.1 .. file.N)
    pub max_generations: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            file: default_data_dir().join("audit.log"),
            max_size_bytes: 5 * 1024 * 1024,
            max_generations: 5,
        }
    }
}

/// Execution history configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum number of retained history entries
    pub capacity: usize,

    /// Coalescing window for history disk flushes in milliseconds
    pub flush_debounce_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            flush_debounce_ms: 1000,
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Token bucket capacity per identity
    pub capacity: u32,

    /// Refill window in seconds (capacity tokens per window, continuous refill)
    pub window_secs: u64,

    /// Idle buckets are garbage-collected after this many seconds
    pub idle_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            window_secs: 60,
            idle_ttl_secs: 3600,
        }
    }
}

/// Subprocess executor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Default timeout in seconds for tools without an override
    pub default_timeout_secs: u64,

    /// Hard ceiling for per-tool timeout overrides
    pub max_timeout_secs: u64,

    /// Maximum captured output size in bytes
    pub max_output_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            max_timeout_secs: 1800,
            max_output_bytes: 10 * 1024 * 1024,
        }
    }
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("toolwarden")
}

impl Config {
    /// Load configuration from the default path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        // Apply environment variable overrides
        let config = config.apply_env_overrides();

        // Validate configuration
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/toolwarden/config.toml`
    pub fn config_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join(".config")
            .join("toolwarden")
            .join("config.toml")
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - TOOLWARDEN_LOG_LEVEL
    /// - TOOLWARDEN_LOG_FORMAT
    /// - TOOLWARDEN_DATA_DIR
    /// - TOOLWARDEN_HISTORY_CAPACITY
    /// - TOOLWARDEN_RATE_CAPACITY
    /// - TOOLWARDEN_DEFAULT_TIMEOUT_SECS
    fn apply_env_overrides(mut self) -> Self {
        // Logging overrides
        if let Ok(level) = std::env::var("TOOLWARDEN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TOOLWARDEN_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(dir) = std::env::var("TOOLWARDEN_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(capacity) = std::env::var("TOOLWARDEN_HISTORY_CAPACITY") {
            if let Ok(capacity) = capacity.parse::<usize>() {
                if capacity > 0 {
                    self.history.capacity = capacity;
                }
            }
        }

        if let Ok(capacity) = std::env::var("TOOLWARDEN_RATE_CAPACITY") {
            if let Ok(capacity) = capacity.parse::<u32>() {
                if capacity > 0 {
                    self.rate_limit.capacity = capacity;
                }
            }
        }

        if let Ok(timeout) = std::env::var("TOOLWARDEN_DEFAULT_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                if timeout > 0 {
                    self.executor.default_timeout_secs = timeout;
                }
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}', expected one of {:?}",
                self.logging.level,
                valid_levels
            );
        }

        let valid_formats = ["json", "pretty", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!(
                "Invalid log format '{}', expected one of {:?}",
                self.logging.format,
                valid_formats
            );
        }

        if self.audit.max_size_bytes == 0 {
            anyhow::bail!("audit.max_size_bytes must be greater than zero");
        }
        if self.audit.max_generations == 0 {
            anyhow::bail!("audit.max_generations must be greater than zero");
        }

        if self.history.capacity == 0 {
            anyhow::bail!("history.capacity must be greater than zero");
        }

        if self.rate_limit.capacity == 0 {
            anyhow::bail!("rate_limit.capacity must be greater than zero");
        }
        if self.rate_limit.window_secs == 0 {
            anyhow::bail!("rate_limit.window_secs must be greater than zero");
        }

        if self.executor.default_timeout_secs == 0 {
            anyhow::bail!("executor.default_timeout_secs must be greater than zero");
        }
        if self.executor.max_timeout_secs < self.executor.default_timeout_secs {
            anyhow::bail!("executor.max_timeout_secs must be at least default_timeout_secs");
        }
        if self.executor.max_output_bytes == 0 {
            anyhow::bail!("executor.max_output_bytes must be greater than zero");
        }

        Ok(())
    }

    /// Save configuration to a specific path
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file to {:?}", path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limit.capacity, 10);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.history.capacity, 1000);
        assert_eq!(config.executor.default_timeout_secs, 300);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let config = Config::load_from_path("/nonexistent/toolwarden.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_partial_file_applies_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[history]
capacity = 25

[rate_limit]
capacity = 3
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.history.capacity, 25);
        assert_eq!(config.rate_limit.capacity, 3);
        // Untouched sections come from defaults
        assert_eq!(config.audit.max_generations, 5);
        assert_eq!(config.executor.max_output_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_timeouts_rejected() {
        let mut config = Config::default();
        config.executor.max_timeout_secs = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.executor.default_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.history.capacity = 42;
        config.audit.max_size_bytes = 1024;
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.history.capacity, 42);
        assert_eq!(loaded.audit.max_size_bytes, 1024);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is { not toml").unwrap();
        assert!(Config::load_from_path(&path).is_err());
    }
}
