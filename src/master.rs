//! MDB bus master.
//!
//! The master claims the bus on the USB board, optionally resets it, and then
//! drives every registered peripheral through its lifecycle.
//!
//! ## Session
//!
//! `initialize` walks the state machine
//! `Uninitialized → ClaimingMastership → ResettingBus → InitializingPeripherals → Ready`
//! exactly once. Before the handshake has been acknowledged every call fails with
//! [`MdbError::NotEstablished`].
//!
//! ## Channel exclusivity
//!
//! The channel sits behind an async mutex that is held for exactly one exchange:
//! a transmit, or a transmit plus its response. Peripherals running concurrently
//! interleave between exchanges, never inside one.
//!
//! ## Failure policy
//!
//! `enable`, `disable` and `status` isolate failures and return one outcome per
//! peripheral. Bring-up and `run` treat any peripheral failure as fatal for the
//! whole session.

use crate::adapters::{to_ascii, Channel};
use crate::error::{AppResult, MdbError};
use crate::fanout::{collect_outcomes, fail_fast, first_fault, Outcome};
use crate::peripheral::{Peripheral, StatusInfo};
use futures::TryFutureExt;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, Instrument, Span};

/// Command asking the board to become bus master
pub const MASTER_ENABLE_COMMAND: &str = "M,1";

/// The only acceptable answer to [`MASTER_ENABLE_COMMAND`]
pub const MASTER_ACK: &str = "m,ACK";

/// Message type of master-mode replies
pub const MASTER_RESPONSE_PREFIX: &str = "m";

/// Command resetting every peripheral on the bus
pub const BUS_RESET_COMMAND: &str = "R,RESET";

/// Time a peripheral needs to come back after a reset (`SETUP_TIME_SECONDS`)
pub const SETUP_TIME: Duration = Duration::from_millis(200);

/// Extra wait covering the bus reset itself
pub const RESET_SAFETY_MARGIN: Duration = Duration::from_millis(100);

/// Where the master is in its session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Constructed, or the handshake was refused
    Uninitialized,
    /// Waiting for the board to acknowledge `M,1`
    ClaimingMastership,
    /// `R,RESET` sent, waiting out the settle delay
    ResettingBus,
    /// Peripherals are being brought up
    InitializingPeripherals,
    /// Session established and all peripherals initialized
    Ready,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BusState::Uninitialized => "uninitialized",
            BusState::ClaimingMastership => "claiming mastership",
            BusState::ResettingBus => "resetting bus",
            BusState::InitializingPeripherals => "initializing peripherals",
            BusState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Master side of the MDB bus
///
/// Owns the channel and the peripheral registry. Peripherals receive `&BusMaster`
/// on every lifecycle call and use [`BusMaster::send`] / [`BusMaster::sendread`]
/// to reach their devices.
///
/// # Example
///
/// ```no_run
/// use mdb_master::adapters::SerialChannel;
/// use mdb_master::BusMaster;
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let channel = SerialChannel::open("/dev/ttyUSB0", 115_200, Duration::from_secs(1))?;
/// let mut master = BusMaster::new("vending");
/// master.initialize(Box::new(channel), Vec::new(), true).await?;
/// for outcome in master.enable().await? {
///     if let Err(e) = outcome {
///         eprintln!("enable failed: {e:#}");
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct BusMaster {
    channel: Option<Mutex<Box<dyn Channel>>>,
    peripherals: Vec<Box<dyn Peripheral>>,
    established: bool,
    state: BusState,
    span: Span,
}

impl BusMaster {
    /// Create an uninitialized master; `name` labels its log span
    pub fn new(name: &str) -> Self {
        Self {
            channel: None,
            peripherals: Vec::new(),
            established: false,
            state: BusState::Uninitialized,
            span: tracing::info_span!("bus_master", name = %name),
        }
    }

    /// Claim the bus, optionally reset it, and bring every peripheral up
    ///
    /// # Arguments
    /// * `channel` - Transport to the board; owned by the master from now on
    /// * `peripherals` - Registry, in the order results will be reported
    /// * `bus_reset` - Send `R,RESET` and wait out the settle delay first
    ///
    /// # Errors
    /// - [`MdbError::Mastership`] if the board does not answer `m,ACK`; nothing
    ///   else is sent and the master stays unusable
    /// - Any channel error from the handshake or the reset command. A failed
    ///   reset leaves the session established in [`BusState::ResettingBus`] with
    ///   the peripherals registered but never initialized.
    /// - [`MdbError::Peripheral`] for the first peripheral (in registry order)
    ///   whose bring-up failed, reported once every bring-up has finished
    pub async fn initialize(
        &mut self,
        channel: Box<dyn Channel>,
        peripherals: Vec<Box<dyn Peripheral>>,
        bus_reset: bool,
    ) -> AppResult<()> {
        let span = self.span.clone();
        self.initialize_inner(channel, peripherals, bus_reset)
            .instrument(span)
            .await
    }

    async fn initialize_inner(
        &mut self,
        channel: Box<dyn Channel>,
        peripherals: Vec<Box<dyn Peripheral>>,
        bus_reset: bool,
    ) -> AppResult<()> {
        info!("Initializing MDB Master.");
        let channel = self.channel.insert(Mutex::new(channel));

        debug!("Enabling Master driver.");
        self.state = BusState::ClaimingMastership;
        let handshake = {
            let mut channel = channel.lock().await;
            let command = to_ascii(MASTER_ENABLE_COMMAND)?;
            channel
                .transmit_and_await(&command, MASTER_RESPONSE_PREFIX)
                .await
        };
        let status = match handshake {
            Ok(status) => status,
            Err(MdbError::PrefixMismatch { response, .. }) => response,
            Err(e) => {
                self.state = BusState::Uninitialized;
                return Err(e);
            }
        };
        if status != MASTER_ACK {
            self.state = BusState::Uninitialized;
            return Err(MdbError::Mastership { response: status });
        }
        self.established = true;
        self.peripherals = peripherals;

        if bus_reset {
            self.state = BusState::ResettingBus;
            debug!("Bus-resetting peripherals.");
            self.send(BUS_RESET_COMMAND).await?;
            tokio::time::sleep(SETUP_TIME + RESET_SAFETY_MARGIN).await;
        }

        self.state = BusState::InitializingPeripherals;
        info!("Initializing MDB peripherals.");

        let this: &Self = self;
        let outcomes = collect_outcomes(
            this.peripherals
                .iter()
                .map(|peripheral| peripheral.initialize(this, !bus_reset)),
        )
        .await;
        if let Err((index, source)) = first_fault(outcomes) {
            return Err(MdbError::peripheral(this.peripherals[index].name(), source));
        }

        self.state = BusState::Ready;
        info!("MDB Master ready with {} peripherals.", self.peripherals.len());
        Ok(())
    }

    /// Send a command without waiting for a response
    ///
    /// # Errors
    /// [`MdbError::NotEstablished`] before `initialize`, or the channel's error
    pub async fn send(&self, message: &str) -> AppResult<()> {
        let channel = self.channel()?;
        let bytes = to_ascii(message)?;
        let mut channel = channel.lock().await;
        channel.transmit(&bytes).await
    }

    /// Send a command and return the raw response of the expected type
    ///
    /// # Errors
    /// [`MdbError::NotEstablished`] before `initialize`; otherwise the channel's
    /// error, typically [`MdbError::Timeout`] or [`MdbError::PrefixMismatch`]
    pub async fn sendread(&self, message: &str, expected_prefix: &str) -> AppResult<String> {
        let channel = self.channel()?;
        let bytes = to_ascii(message)?;
        let mut channel = channel.lock().await;
        channel.transmit_and_await(&bytes, expected_prefix).await
    }

    /// Enable every peripheral; one outcome per peripheral, in registry order
    pub async fn enable(&self) -> AppResult<Vec<Outcome<()>>> {
        self.ensure_established()?;
        let outcomes = async {
            info!("Enabling MDB peripherals.");
            collect_outcomes(self.peripherals.iter().map(|p| p.enable(self))).await
        }
        .instrument(self.span.clone())
        .await;
        Ok(outcomes)
    }

    /// Disable every peripheral; one outcome per peripheral, in registry order
    pub async fn disable(&self) -> AppResult<Vec<Outcome<()>>> {
        self.ensure_established()?;
        let outcomes = async {
            info!("Disabling MDB peripherals.");
            collect_outcomes(self.peripherals.iter().map(|p| p.disable(self))).await
        }
        .instrument(self.span.clone())
        .await;
        Ok(outcomes)
    }

    /// Query every peripheral's status; one outcome per peripheral, in registry order
    pub async fn status(&self) -> AppResult<Vec<Outcome<StatusInfo>>> {
        self.ensure_established()?;
        let outcomes = async {
            info!("Getting MDB peripheral statuses.");
            collect_outcomes(self.peripherals.iter().map(|p| p.status(self))).await
        }
        .instrument(self.span.clone())
        .await;
        Ok(outcomes)
    }

    /// Run every peripheral's polling loop until one of them fails
    ///
    /// The returned future normally never completes; drop it to stop the loops.
    ///
    /// # Errors
    /// [`MdbError::Peripheral`] for the first peripheral whose loop failed
    pub async fn run(&self) -> AppResult<()> {
        self.ensure_established()?;
        async {
            info!("Running MDB peripherals.");
            fail_fast(self.peripherals.iter().map(|p| {
                p.run(self)
                    .map_err(move |source| MdbError::peripheral(p.name(), source))
            }))
            .await
            .map(|_| ())
        }
        .instrument(self.span.clone())
        .await
    }

    /// Whether the handshake succeeded
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Current lifecycle state
    pub fn state(&self) -> BusState {
        self.state
    }

    /// Number of registered peripherals
    pub fn peripheral_count(&self) -> usize {
        self.peripherals.len()
    }

    /// Names of the registered peripherals, in registry order
    pub fn peripheral_names(&self) -> Vec<&str> {
        self.peripherals.iter().map(|p| p.name()).collect()
    }

    fn ensure_established(&self) -> AppResult<()> {
        if self.established {
            Ok(())
        } else {
            Err(MdbError::NotEstablished)
        }
    }

    fn channel(&self) -> AppResult<&Mutex<Box<dyn Channel>>> {
        self.ensure_established()?;
        self.channel.as_ref().ok_or(MdbError::NotEstablished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockChannel;
    use crate::peripheral::MockPeripheral;

    #[tokio::test]
    async fn test_new_master_is_uninitialized() {
        let master = BusMaster::new("test");
        assert!(!master.is_established());
        assert_eq!(master.state(), BusState::Uninitialized);
        assert_eq!(master.peripheral_count(), 0);
    }

    #[tokio::test]
    async fn test_send_before_initialize_is_a_precondition_fault() {
        let master = BusMaster::new("test");
        assert!(matches!(
            master.send("R,33").await.unwrap_err(),
            MdbError::NotEstablished
        ));
        assert!(matches!(
            master.sendread("R,33", "p").await.unwrap_err(),
            MdbError::NotEstablished
        ));
        assert!(matches!(master.enable().await.unwrap_err(), MdbError::NotEstablished));
        assert!(matches!(master.run().await.unwrap_err(), MdbError::NotEstablished));
    }

    #[tokio::test]
    async fn test_handshake_without_reset() {
        let channel = MockChannel::new().with_response("M,1", "m,ACK");
        let mut master = BusMaster::new("test");

        master
            .initialize(Box::new(channel.clone()), Vec::new(), false)
            .await
            .unwrap();

        assert!(master.is_established());
        assert_eq!(master.state(), BusState::Ready);
        assert_eq!(channel.transmitted(), vec!["M,1".to_string()]);
    }

    #[tokio::test]
    async fn test_handshake_channel_error_propagates() {
        let channel = MockChannel::new();
        let mut master = BusMaster::new("test");

        let err = master
            .initialize(Box::new(channel), Vec::new(), true)
            .await
            .unwrap_err();

        assert!(matches!(err, MdbError::Timeout { .. }));
        assert!(!master.is_established());
        assert_eq!(master.state(), BusState::Uninitialized);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_logs_are_scoped_to_the_master_instance() {
        let channel = MockChannel::new().with_response("M,1", "m,ACK");
        let mut master = BusMaster::new("kiosk-7");

        master
            .initialize(Box::new(channel), Vec::new(), false)
            .await
            .unwrap();

        assert!(logs_contain("Initializing MDB Master."));
        assert!(logs_contain("kiosk-7"));
        assert!(!logs_contain("Bus-resetting peripherals."));
    }

    #[tokio::test]
    async fn test_failed_reset_keeps_registry_uninitialized() {
        let channel = MockChannel::new()
            .with_response("M,1", "m,ACK")
            .with_failing_command(BUS_RESET_COMMAND);
        let coin_acceptor = MockPeripheral::new("coin_acceptor");
        let mut master = BusMaster::new("test");

        let err = master
            .initialize(
                Box::new(channel),
                vec![Box::new(coin_acceptor.clone())],
                true,
            )
            .await
            .unwrap_err();

        assert!(err.is_channel_error());
        assert!(master.is_established());
        assert_eq!(master.state(), BusState::ResettingBus);
        assert_eq!(master.peripheral_names(), vec!["coin_acceptor"]);
        assert!(coin_acceptor.calls().is_empty());
    }

    #[test]
    fn test_settle_delay_constants() {
        assert_eq!(SETUP_TIME + RESET_SAFETY_MARGIN, Duration::from_millis(300));
        assert_eq!(BusState::ResettingBus.to_string(), "resetting bus");
    }
}
