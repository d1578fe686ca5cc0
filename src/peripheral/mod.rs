//! Peripheral driver contract.
//!
//! Every device type on the bus (bill validator, coin acceptor, ...) implements
//! [`Peripheral`]. The bus master owns the drivers and hands itself to every
//! lifecycle call, so a driver can issue its own commands through
//! [`BusMaster::send`] and [`BusMaster::sendread`] without holding a pointer back
//! to the master.

use crate::master::BusMaster;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod mock;

pub use mock::{MockPeripheral, Operation, PeripheralCall};

/// Status snapshot reported by one peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// Name of the reporting peripheral
    pub peripheral: String,
    /// Whether the peripheral currently accepts vending activity
    pub enabled: bool,
    /// Driver-specific detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Lifecycle capability of an MDB peripheral driver
#[async_trait]
pub trait Peripheral: Send + Sync {
    /// Human-readable name used in logs and errors
    fn name(&self) -> &str;

    /// Bring the device up. Called once, after the bus is established.
    ///
    /// `skip_setup_delay` is true when no bus reset preceded this call, so the
    /// driver need not wait out its own setup time again.
    async fn initialize(&self, master: &BusMaster, skip_setup_delay: bool) -> Result<()>;

    /// Enable the device for vending activity
    async fn enable(&self, master: &BusMaster) -> Result<()>;

    /// Disable the device for vending activity
    async fn disable(&self, master: &BusMaster) -> Result<()>;

    /// Report the device status
    async fn status(&self, master: &BusMaster) -> Result<StatusInfo>;

    /// Persistent polling loop; expected to run until cancelled
    async fn run(&self, master: &BusMaster) -> Result<()>;
}
