//! Figment-backed master configuration.

use crate::adapters::serial_adapter::{DEFAULT_BAUD_RATE, DEFAULT_RESPONSE_TIMEOUT};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration file read by [`MasterConfig::load`]
pub const DEFAULT_CONFIG_PATH: &str = "mdb.toml";

const ENV_PREFIX: &str = "MDB_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be parsed
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are out of range
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Settings for one bus master session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Serial device of the MDB USB board
    #[serde(default = "default_device_path")]
    pub device_path: String,
    /// Serial speed
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// How long to wait for a board response, in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Reset the bus after claiming mastership
    #[serde(default = "default_bus_reset")]
    pub bus_reset: bool,
    /// Start the bus sniffer alongside the master
    #[serde(default)]
    pub sniff: bool,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            device_path: default_device_path(),
            baud_rate: default_baud_rate(),
            response_timeout_ms: default_response_timeout_ms(),
            bus_reset: default_bus_reset(),
            sniff: false,
            log_level: default_log_level(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_device_path() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64
}

fn default_bus_reset() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl MasterConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(path))
    }

    /// Layered provider: defaults, then `path`, then `MDB_*` variables
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(MasterConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Extract and validate a configuration from any figment
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_path.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "'device_path' cannot be empty".to_string(),
            ));
        }

        if self.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "'baud_rate' must be > 0".to_string(),
            ));
        }

        if self.response_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "'response_timeout_ms' must be > 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    /// Response timeout as a [`Duration`]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}
