//! Mock Peripheral Implementation
//!
//! Provides a simulated MDB peripheral for testing the bus master without
//! physical devices. All waiting uses async-safe operations (tokio::time::sleep,
//! not std::thread::sleep).
//!
//! The mock records every lifecycle call with a timestamp, can be told to fail
//! any operation, and can issue a real command through the master during
//! `initialize` and on every `run` poll.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::debug;

use super::{Peripheral, StatusInfo};
use crate::master::BusMaster;

/// Default pause between two `run` polls
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle operation of a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `initialize`
    Initialize,
    /// `enable`
    Enable,
    /// `disable`
    Disable,
    /// `status`
    Status,
    /// `run`
    Run,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Initialize => "initialize",
            Operation::Enable => "enable",
            Operation::Disable => "disable",
            Operation::Status => "status",
            Operation::Run => "run",
        };
        f.write_str(name)
    }
}

/// One recorded lifecycle call
#[derive(Debug, Clone)]
pub struct PeripheralCall {
    /// Which operation was invoked
    pub operation: Operation,
    /// When the call was dispatched to the peripheral
    pub at: Instant,
    /// The `skip_setup_delay` flag, for `initialize` calls
    pub skip_setup_delay: Option<bool>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<PeripheralCall>,
    enabled: bool,
    failing: HashSet<Operation>,
}

// =============================================================================
// MockPeripheral
// =============================================================================

/// Scripted peripheral driver
///
/// Clones share state, so a test can keep a handle after moving a boxed clone
/// into the master's registry.
///
/// # Example
///
/// ```rust,ignore
/// let validator = MockPeripheral::new("bill_validator").fail_on(Operation::Enable);
/// master.initialize(channel, vec![Box::new(validator.clone())], false).await?;
/// let outcomes = master.enable().await?;
/// assert!(outcomes[0].is_err());
/// ```
#[derive(Clone)]
pub struct MockPeripheral {
    name: String,
    latency: Duration,
    poll: Option<(String, String)>,
    poll_interval: Duration,
    state: Arc<Mutex<MockState>>,
}

impl MockPeripheral {
    /// Create a mock peripheral that succeeds instantly at everything
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: Duration::ZERO,
            poll: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Spend `latency` inside every operation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Issue `command` through the master during `initialize` and every `run` poll
    pub fn with_poll_command(mut self, command: &str, expected_prefix: &str) -> Self {
        self.poll = Some((command.to_string(), expected_prefix.to_string()));
        self
    }

    /// Pause between `run` polls
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Make `operation` fail from now on
    pub fn fail_on(self, operation: Operation) -> Self {
        self.lock().failing.insert(operation);
        self
    }

    /// All recorded calls in dispatch order
    pub fn calls(&self) -> Vec<PeripheralCall> {
        self.lock().calls.clone()
    }

    /// Recorded calls of one operation
    pub fn calls_to(&self, operation: Operation) -> Vec<PeripheralCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .cloned()
            .collect()
    }

    /// Current enable state
    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call, simulate the work, then apply the failure script
    async fn perform(&self, operation: Operation, skip_setup_delay: Option<bool>) -> Result<()> {
        self.lock().calls.push(PeripheralCall {
            operation,
            at: Instant::now(),
            skip_setup_delay,
        });
        debug!("{}: {}", self.name, operation);

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        if self.lock().failing.contains(&operation) {
            bail!("{} failed to {}", self.name, operation);
        }
        Ok(())
    }

    async fn poll_once(&self, master: &BusMaster) -> Result<()> {
        if let Some((command, prefix)) = &self.poll {
            master
                .sendread(command, prefix)
                .await
                .with_context(|| format!("{} poll '{}' failed", self.name, command))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Peripheral for MockPeripheral {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, master: &BusMaster, skip_setup_delay: bool) -> Result<()> {
        self.perform(Operation::Initialize, Some(skip_setup_delay))
            .await?;
        self.poll_once(master).await
    }

    async fn enable(&self, _master: &BusMaster) -> Result<()> {
        self.perform(Operation::Enable, None).await?;
        self.lock().enabled = true;
        Ok(())
    }

    async fn disable(&self, _master: &BusMaster) -> Result<()> {
        self.perform(Operation::Disable, None).await?;
        self.lock().enabled = false;
        Ok(())
    }

    async fn status(&self, _master: &BusMaster) -> Result<StatusInfo> {
        self.perform(Operation::Status, None).await?;
        Ok(StatusInfo {
            peripheral: self.name.clone(),
            enabled: self.is_enabled(),
            detail: None,
        })
    }

    async fn run(&self, master: &BusMaster) -> Result<()> {
        self.perform(Operation::Run, None).await?;
        loop {
            self.poll_once(master).await?;
            sleep(self.poll_interval).await;
        }
    }
}
