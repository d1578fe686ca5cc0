//! Channel adapter implementations
//!
//! This module contains the [`Channel`] trait the bus master sends through and its
//! implementations: the serial board adapter and a scripted mock for tests.

use crate::error::{AppResult, MdbError};
use async_trait::async_trait;

pub mod mock_adapter;
pub mod serial_adapter;

pub use mock_adapter::{ChannelEvent, MockChannel};
pub use serial_adapter::SerialChannel;

/// Half-duplex command/response transport to the MDB board.
///
/// Implementations own framing, encoding and timeout detection. Exclusive access
/// is the caller's concern: the bus master serializes every exchange.
#[async_trait]
pub trait Channel: Send {
    /// Write a command without waiting for any response.
    async fn transmit(&mut self, message: &[u8]) -> AppResult<()>;

    /// Write a command and wait for the next response of the expected type.
    ///
    /// Fails with [`MdbError::Timeout`] when nothing arrives in time and with
    /// [`MdbError::PrefixMismatch`] when the response does not start with
    /// `expected_prefix`.
    async fn transmit_and_await(
        &mut self,
        message: &[u8],
        expected_prefix: &str,
    ) -> AppResult<String>;
}

/// Encode a board command as ASCII, appending the `\n` terminator if missing.
pub fn to_ascii(message: &str) -> AppResult<Vec<u8>> {
    if !message.is_ascii() {
        return Err(MdbError::Encoding(format!(
            "command {:?} is not ASCII",
            message
        )));
    }
    let mut bytes = message.as_bytes().to_vec();
    if bytes.last() != Some(&b'\n') {
        bytes.push(b'\n');
    }
    Ok(bytes)
}
