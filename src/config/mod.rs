//! Master configuration
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `MDB_`
//! 2. TOML configuration file (default: `mdb.toml`)
//! 3. Built-in defaults
//!
//! # Example
//!
//! ```no_run
//! use mdb_master::config::MasterConfig;
//!
//! let config = MasterConfig::load_from("mdb.toml")?;
//! println!("Board at {} ({} baud)", config.device_path, config.baud_rate);
//! # Ok::<(), mdb_master::config::ConfigError>(())
//! ```
//!
//! # Environment Variables
//!
//! ```text
//! MDB_DEVICE_PATH=/dev/ttyACM0
//! MDB_BUS_RESET=false
//! MDB_RESPONSE_TIMEOUT_MS=2000
//! ```

pub mod master_config;

pub use master_config::{ConfigError, MasterConfig, DEFAULT_CONFIG_PATH};
