//! Mock channel adapter for testing
//!
//! This adapter stands in for the MDB board when exercising the bus master and
//! peripheral drivers without hardware. It provides:
//! - Scripted responses keyed by command, or a responder closure
//! - Simulated latency inside every exchange
//! - Controllable failure injection
//! - An event log for test verification

use super::Channel;
use crate::error::{AppResult, MdbError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type Responder = dyn Fn(&str) -> Option<String> + Send + Sync;

/// One entry of the mock channel's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A command was written (terminator stripped).
    Transmit(String),
    /// A response was handed back to the caller.
    Response(String),
}

/// Scripted in-memory channel
///
/// Clones share the same script and event log, so a test can keep a handle
/// after boxing the channel into a [`crate::BusMaster`].
///
/// # Example
///
/// ```
/// use mdb_master::adapters::{ChannelEvent, MockChannel};
///
/// let channel = MockChannel::new().with_response("M,1", "m,ACK");
/// assert!(channel.events().is_empty());
/// ```
#[derive(Clone)]
pub struct MockChannel {
    responses: Arc<Mutex<HashMap<String, String>>>,
    responder: Option<Arc<Responder>>,
    latency: Duration,
    should_fail_next: Arc<AtomicBool>,
    failing_commands: Arc<Mutex<HashSet<String>>>,
    events: Arc<Mutex<Vec<ChannelEvent>>>,
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChannel {
    /// Create a mock channel with no scripted responses and no latency
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            responder: None,
            latency: Duration::ZERO,
            should_fail_next: Arc::new(AtomicBool::new(false)),
            failing_commands: Arc::new(Mutex::new(HashSet::new())),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answer `command` with `response`
    pub fn with_response(self, command: &str, response: &str) -> Self {
        lock(&self.responses).insert(command.to_string(), response.to_string());
        self
    }

    /// Compute responses with a closure; returning `None` simulates silence.
    ///
    /// Takes precedence over responses registered with [`Self::with_response`].
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Suspend for `latency` inside every exchange, between write and response
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Fail every write of `command`
    pub fn with_failing_command(self, command: &str) -> Self {
        lock(&self.failing_commands).insert(command.to_string());
        self
    }

    /// Full event log in order
    pub fn events(&self) -> Vec<ChannelEvent> {
        lock(&self.events).clone()
    }

    /// Only the commands that were written, in order
    pub fn transmitted(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                ChannelEvent::Transmit(command) => Some(command.clone()),
                ChannelEvent::Response(_) => None,
            })
            .collect()
    }

    /// Clear the event log
    pub fn clear_log(&self) {
        lock(&self.events).clear();
    }

    fn check_failure(&self, command: &str) -> AppResult<()> {
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(MdbError::Channel("Injected failure".to_string()));
        }
        if lock(&self.failing_commands).contains(command) {
            return Err(MdbError::Channel(format!("Injected failure for '{}'", command)));
        }
        Ok(())
    }

    fn log(&self, event: ChannelEvent) {
        lock(&self.events).push(event);
    }

    fn respond(&self, command: &str) -> Option<String> {
        match &self.responder {
            Some(responder) => responder(command),
            None => lock(&self.responses).get(command).cloned(),
        }
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn decode(message: &[u8]) -> String {
    String::from_utf8_lossy(message).trim_end().to_string()
}

#[async_trait]
impl Channel for MockChannel {
    async fn transmit(&mut self, message: &[u8]) -> AppResult<()> {
        let command = decode(message);
        self.check_failure(&command)?;
        self.log(ChannelEvent::Transmit(command));
        self.simulate_latency().await;
        Ok(())
    }

    async fn transmit_and_await(
        &mut self,
        message: &[u8],
        expected_prefix: &str,
    ) -> AppResult<String> {
        let command = decode(message);
        self.check_failure(&command)?;
        self.log(ChannelEvent::Transmit(command.clone()));
        self.simulate_latency().await;

        let response = self.respond(&command).ok_or_else(|| MdbError::Timeout {
            prefix: expected_prefix.to_string(),
            after: self.latency,
        })?;
        self.log(ChannelEvent::Response(response.clone()));

        if !response.starts_with(expected_prefix) {
            return Err(MdbError::PrefixMismatch {
                expected: expected_prefix.to_string(),
                response,
            });
        }
        Ok(response)
    }
}
