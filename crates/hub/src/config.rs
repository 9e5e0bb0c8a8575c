//! Configuration management for the ForgeHub core.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/forgehub/config.toml`.

use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port range must satisfy 0 < start <= end, got {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("{0} must be greater than 0")]
    ZeroTimeout(&'static str),

    #[error("discovery passes must be at least 1, got {0}")]
    InvalidDiscoveryPasses(u32),

    #[error("failure_threshold must be at least 1, got {0}")]
    InvalidFailureThreshold(u32),

    #[error("backoff_multiplier must be a finite value >= 1.0, got {0}")]
    InvalidBackoffMultiplier(f64),

    #[error("poll intervals must satisfy active <= idle <= error <= max")]
    InvalidIntervalOrder,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("FORGEHUB_PORT_RANGE must look like 8181-8190, got {0:?}")]
    InvalidPortRangeOverride(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Camera proxy port pool.
    pub ports: PortConfig,

    /// Direct-connect settings.
    pub connect: ConnectConfig,

    /// Discovery scan settings.
    pub discovery: DiscoveryConfig,

    /// Status polling cadence.
    pub polling: PollingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for daily-rolling log files. Unset logs to stderr only.
    pub log_dir: Option<PathBuf>,
}

/// Inclusive range of camera proxy ports leased to contexts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PortConfig {
    /// First port of the pool.
    pub start: u16,

    /// Last port of the pool (inclusive).
    pub end: u16,
}

/// Direct-connect configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectConfig {
    /// Upper bound for one connect/negotiate attempt, in milliseconds.
    pub timeout_ms: u64,
}

/// Discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Number of scan passes.
    pub passes: u32,

    /// Listening window of a single pass, in milliseconds.
    pub pass_timeout_ms: u64,

    /// Upper bound for the whole scan, in milliseconds.
    pub overall_timeout_ms: u64,
}

/// Adaptive polling configuration.
///
/// Only the shape is binding: active jobs poll faster than idle printers,
/// failing printers back off up to `max_interval_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    /// Cadence while a job is running.
    pub active_interval_ms: u64,

    /// Cadence while the printer is idle.
    pub idle_interval_ms: u64,

    /// Minimum cadence once a context is in the error state.
    pub error_interval_ms: u64,

    /// Upper bound for any backoff.
    pub max_interval_ms: u64,

    /// Factor applied to the cadence after each failed poll.
    pub backoff_multiplier: f64,

    /// Consecutive failures before a context enters the error state.
    pub failure_threshold: u32,

    /// Upper bound for a single poll.
    pub poll_timeout_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            start: 8181,
            end: 8190,
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            passes: 3,
            pass_timeout_ms: 2_000,
            overall_timeout_ms: 10_000,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            active_interval_ms: 1_000,
            idle_interval_ms: 3_000,
            error_interval_ms: 10_000,
            max_interval_ms: 30_000,
            backoff_multiplier: 1.5,
            failure_threshold: 3,
            poll_timeout_ms: 5_000,
        }
    }
}

impl PortConfig {
    /// The configured pool as an inclusive range.
    pub fn range(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }
}

impl ConnectConfig {
    /// Connect timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl DiscoveryConfig {
    /// Single pass window as a duration.
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_millis(self.pass_timeout_ms)
    }

    /// Whole scan bound as a duration.
    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }
}

impl PollingConfig {
    pub fn active_interval(&self) -> Duration {
        Duration::from_millis(self.active_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn error_interval(&self) -> Duration {
        Duration::from_millis(self.error_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("forgehub")
        .join("config.toml")
}

/// Parses a `start-end` port range.
fn parse_port_range(raw: &str) -> Option<(u16, u16)> {
    let (start, end) = raw.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - FORGEHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - FORGEHUB_PORT_RANGE: Override the camera port pool, e.g. `9000-9015`
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(level) = std::env::var("FORGEHUB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(raw) = std::env::var("FORGEHUB_PORT_RANGE") {
            if !raw.is_empty() {
                let (start, end) = parse_port_range(&raw)
                    .ok_or_else(|| ConfigError::InvalidPortRangeOverride(raw.clone()))?;
                tracing::info!("Overriding port range from environment: {}-{}", start, end);
                self.ports.start = start;
                self.ports.end = end;
            }
        }

        Ok(())
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.start == 0 || self.ports.start > self.ports.end {
            return Err(ConfigError::InvalidPortRange {
                start: self.ports.start,
                end: self.ports.end,
            });
        }

        if self.connect.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("connect.timeout_ms"));
        }
        if self.discovery.pass_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("discovery.pass_timeout_ms"));
        }
        if self.discovery.overall_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("discovery.overall_timeout_ms"));
        }
        if self.polling.poll_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("polling.poll_timeout_ms"));
        }
        if self.polling.active_interval_ms == 0 {
            return Err(ConfigError::ZeroTimeout("polling.active_interval_ms"));
        }

        if self.discovery.passes == 0 {
            return Err(ConfigError::InvalidDiscoveryPasses(self.discovery.passes));
        }

        if self.polling.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold(
                self.polling.failure_threshold,
            ));
        }

        let multiplier = self.polling.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(multiplier));
        }

        let p = &self.polling;
        if !(p.active_interval_ms <= p.idle_interval_ms
            && p.idle_interval_ms <= p.error_interval_ms
            && p.error_interval_ms <= p.max_interval_ms)
        {
            return Err(ConfigError::InvalidIntervalOrder);
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path and apply the `FORGEHUB_*`
    /// environment overrides.
    pub fn load_default() -> Result<Self> {
        Self::load_with_env(default_config_path())
    }

    /// Load configuration from a file, then apply environment overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config
            .apply_env_overrides()
            .context("Invalid environment override")?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.logging.level, "info");
        assert!(config.logging.log_dir.is_none());
        assert_eq!(config.ports.range(), 8181..=8190);
        assert_eq!(config.connect.timeout(), Duration::from_secs(10));
        assert_eq!(config.discovery.passes, 3);
        assert_eq!(config.polling.failure_threshold, 3);
        assert!(config.polling.active_interval() < config.polling.idle_interval());
    }

    #[test]
    fn test_validate_default_config() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[ports]
start = 9000
end = 9003

[polling]
idle_interval_ms = 4000
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.ports.range(), 9000..=9003);
        assert_eq!(config.polling.idle_interval(), Duration::from_secs(4));
        assert_eq!(config.polling.active_interval_ms, 1_000);
        assert_eq!(config.connect, ConnectConfig::default());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[ports\nstart = 1");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML configuration"), "got: {err}");
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[ports]\nstart = \"eighty\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut config = Config::default();
        config.ports.start = 7000;
        config.ports.end = 7001;
        config.logging.log_dir = Some(PathBuf::from("/var/log/forgehub"));
        config.polling.backoff_multiplier = 2.0;

        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories_and_loads() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("config.toml");

        let mut config = Config::default();
        config.discovery.passes = 5;
        config.save(&path).unwrap();

        assert!(path.exists());
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.discovery.passes, 5);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "not [valid toml").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("forgehub/config.toml"));
    }

    #[test]
    fn test_validate_port_range() {
        let mut config = Config::default();
        config.ports.start = 9000;
        config.ports.end = 8999;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPortRange {
                start: 9000,
                end: 8999
            })
        );

        config.ports.start = 0;
        config.ports.end = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPortRange { .. })
        ));

        config.ports.start = 9000;
        config.ports.end = 9000;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = Config::default();
        config.connect.timeout_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroTimeout("connect.timeout_ms"))
        );
    }

    #[test]
    fn test_validate_interval_order() {
        let mut config = Config::default();
        config.polling.active_interval_ms = 5_000;
        config.polling.idle_interval_ms = 1_000;
        assert_eq!(config.validate(), Err(ConfigError::InvalidIntervalOrder));
    }

    #[test]
    fn test_validate_backoff_and_threshold() {
        let mut config = Config::default();
        config.polling.backoff_multiplier = 0.5;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBackoffMultiplier(0.5))
        );

        let mut config = Config::default();
        config.polling.failure_threshold = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidFailureThreshold(0))
        );

        let mut config = Config::default();
        config.discovery.passes = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDiscoveryPasses(0))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "DEBUG".to_string();
        assert_eq!(config.validate(), Ok(()));

        config.logging.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("9000-9015"), Some((9000, 9015)));
        assert_eq!(parse_port_range(" 1 - 2 "), Some((1, 2)));
        assert_eq!(parse_port_range("9000"), None);
        assert_eq!(parse_port_range("a-b"), None);
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("FORGEHUB_LOG_LEVEL", "trace");
        std::env::remove_var("FORGEHUB_PORT_RANGE");

        let mut config = Config::default();
        config.apply_env_overrides().unwrap();
        assert_eq!(config.logging.level, "trace");

        std::env::remove_var("FORGEHUB_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_port_range() {
        std::env::remove_var("FORGEHUB_LOG_LEVEL");
        std::env::set_var("FORGEHUB_PORT_RANGE", "9100-9103");

        let mut config = Config::default();
        config.apply_env_overrides().unwrap();
        assert_eq!(config.ports.range(), 9100..=9103);

        std::env::remove_var("FORGEHUB_PORT_RANGE");
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_port_range() {
        std::env::set_var("FORGEHUB_PORT_RANGE", "lots");

        let mut config = Config::default();
        let result = config.apply_env_overrides();
        assert_eq!(
            result,
            Err(ConfigError::InvalidPortRangeOverride("lots".to_string()))
        );
        assert_eq!(config.ports, PortConfig::default());

        std::env::remove_var("FORGEHUB_PORT_RANGE");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("FORGEHUB_LOG_LEVEL", "");
        std::env::set_var("FORGEHUB_PORT_RANGE", "");

        let mut config = Config::default();
        config.apply_env_overrides().unwrap();
        assert_eq!(config, Config::default());

        std::env::remove_var("FORGEHUB_LOG_LEVEL");
        std::env::remove_var("FORGEHUB_PORT_RANGE");
    }

    #[test]
    #[serial]
    fn test_load_with_env_applies_overrides() {
        std::env::remove_var("FORGEHUB_LOG_LEVEL");
        std::env::set_var("FORGEHUB_PORT_RANGE", "9200-9201");

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        let mut config = Config::default();
        config.ports.start = 8500;
        config.ports.end = 8509;
        config.discovery.passes = 4;
        config.save(&path).unwrap();

        let loaded = Config::load_with_env(&path).unwrap();
        assert_eq!(loaded.ports.range(), 9200..=9201);
        assert_eq!(loaded.discovery.passes, 4);

        std::env::set_var("FORGEHUB_PORT_RANGE", "lots");
        assert!(Config::load_with_env(&path).is_err());

        std::env::remove_var("FORGEHUB_PORT_RANGE");
        assert_eq!(Config::load_with_env(&path).unwrap().ports.range(), 8500..=8509);
    }
}
