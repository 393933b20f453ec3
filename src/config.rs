//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::time::Duration;

use crate::error::DataError;

/// Default connection checkout interval (one hour)
pub const DEFAULT_CHECKOUT_INTERVAL_SECS: u64 = 3600;

/// Default entity cache capacity
pub const DEFAULT_CACHE_MAX_CAPACITY: u64 = 10_000;

/// Top-level settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: ClientOptions,
    #[serde(default)]
    pub checkout: CheckoutSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Options for a single data context
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClientOptions {
    /// sqlx connection string (e.g. "sqlite://data/app.db?mode=rwc")
    pub connection_string: String,
    /// Per-command timeout in seconds; `None` lets commands run to completion
    #[serde(default)]
    pub command_timeout: Option<u64>,
    /// Materialize joined results before mapping (default: true)
    #[serde(default = "default_buffered")]
    pub buffered: bool,
}

fn default_buffered() -> bool {
    true
}

impl ClientOptions {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            command_timeout: None,
            buffered: true,
        }
    }

    pub fn with_command_timeout(mut self, seconds: u64) -> Self {
        self.command_timeout = Some(seconds);
        self
    }

    pub fn with_buffered(mut self, buffered: bool) -> Self {
        self.buffered = buffered;
        self
    }

    /// Command timeout as a `Duration`
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout.map(Duration::from_secs)
    }

    pub(crate) fn validate(&self) -> Result<(), DataError> {
        if self.connection_string.trim().is_empty() {
            return Err(DataError::Config(
                "database.connection_string must not be empty".to_string(),
            ));
        }

        if self.command_timeout == Some(0) {
            return Err(DataError::Config(
                "database.command_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Connection checkout validator settings
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSettings {
    /// Run the validator at all
    #[serde(default = "default_checkout_enabled")]
    pub enabled: bool,
    /// Seconds between checkouts (default: 3600)
    #[serde(default = "default_checkout_interval")]
    pub interval_seconds: u64,
}

fn default_checkout_enabled() -> bool {
    true
}

fn default_checkout_interval() -> u64 {
    DEFAULT_CHECKOUT_INTERVAL_SECS
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: DEFAULT_CHECKOUT_INTERVAL_SECS,
        }
    }
}

impl CheckoutSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Entity cache settings
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Maximum number of entries before eviction (default: 10000)
    #[serde(default = "default_cache_max_capacity")]
    pub max_capacity: u64,
}

fn default_cache_max_capacity() -> u64 {
    DEFAULT_CACHE_MAX_CAPACITY
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_capacity: DEFAULT_CACHE_MAX_CAPACITY,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Settings {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (SQLCONTEXT__*)
    ///
    /// # Errors
    /// Returns error if configuration is missing or invalid
    pub fn load() -> Result<Self, DataError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("database.buffered", true)?
            .set_default("checkout.enabled", true)?
            .set_default("checkout.interval_seconds", DEFAULT_CHECKOUT_INTERVAL_SECS)?
            .set_default("cache.max_capacity", DEFAULT_CACHE_MAX_CAPACITY)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("SQLCONTEXT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), DataError> {
        self.database.validate()?;

        if self.checkout.interval_seconds == 0 {
            return Err(DataError::Config(
                "checkout.interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.cache.max_capacity == 0 {
            return Err(DataError::Config(
                "cache.max_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settings() -> Settings {
        Settings {
            database: ClientOptions::new("sqlite://data/test.db?mode=rwc"),
            checkout: CheckoutSettings::default(),
            cache: CacheSettings::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        let settings = valid_settings();
        assert!(settings.validate().is_ok());
        assert!(settings.database.buffered);
        assert_eq!(settings.checkout.interval(), Duration::from_secs(3600));
    }

    #[test]
    fn validate_rejects_empty_connection_string() {
        let mut settings = valid_settings();
        settings.database.connection_string = "   ".to_string();

        let error = settings
            .validate()
            .expect_err("empty connection string must fail");
        assert!(matches!(
            error,
            DataError::Config(message) if message.contains("connection_string")
        ));
    }

    #[test]
    fn validate_rejects_zero_timeouts_and_intervals() {
        let mut settings = valid_settings();
        settings.database.command_timeout = Some(0);
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.checkout.interval_seconds = 0;
        let error = settings.validate().expect_err("zero interval must fail");
        assert!(matches!(
            error,
            DataError::Config(message) if message.contains("checkout.interval_seconds")
        ));
    }

    #[test]
    fn command_timeout_converts_to_duration() {
        let options = ClientOptions::new("sqlite::memory:").with_command_timeout(30);
        assert_eq!(options.command_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(ClientOptions::new("sqlite::memory:").command_timeout(), None);
    }
}
