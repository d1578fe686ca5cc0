//! Core library for the mdb_master driver.
//!
//! This library drives a Multi-Drop Bus (MDB) of vending peripherals through a
//! USB serial board. It contains the bus master, the channel adapters that talk
//! to the board, the peripheral driver contract and the passive bus sniffer. It
//! is used by the `mdb_master` binary and by integrators that supply their own
//! peripheral drivers.
//!
//! # Example
//!
//! ```no_run
//! use mdb_master::adapters::SerialChannel;
//! use mdb_master::{BusMaster, MasterConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = MasterConfig::load()?;
//! let channel = SerialChannel::open(
//!     &config.device_path,
//!     config.baud_rate,
//!     config.response_timeout(),
//! )?;
//!
//! let mut master = BusMaster::new("vending");
//! master.initialize(Box::new(channel), Vec::new(), config.bus_reset).await?;
//! let statuses = master.status().await?;
//! println!("{} peripherals reported", statuses.len());
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod fanout;
pub mod master;
pub mod message;
pub mod peripheral;
pub mod sniffer;

pub use adapters::{Channel, MockChannel, SerialChannel};
pub use config::MasterConfig;
pub use error::{AppResult, MdbError};
pub use fanout::Outcome;
pub use master::{BusMaster, BusState};
pub use peripheral::{MockPeripheral, Peripheral, StatusInfo};
pub use sniffer::Sniffer;
