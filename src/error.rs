//! Custom error types for the bus master.
//!
//! This module defines the primary error type, `MdbError`, shared by the master,
//! the channel adapters and the board message envelope. Using the `thiserror` crate,
//! it gives every failure on the bus a distinct, matchable variant.
//!
//! ## Error Hierarchy
//!
//! `MdbError` consolidates the failures that can occur while driving the bus:
//!
//! - **`NotEstablished`**: The master was used before `initialize` claimed the bus.
//!   This is a programming error in the caller, never a transient condition.
//! - **`SnifferNotInitialized`**: The sniffer was run before `initialize` put the
//!   board into sniff mode. Also a caller error.
//! - **`Mastership`**: The board answered the `M,1` handshake with something other
//!   than `m,ACK`. Initialization is aborted and the session stays unusable.
//! - **`Channel`**, **`Io`**, **`Timeout`**, **`PrefixMismatch`**, **`RoutingConflict`**,
//!   **`Encoding`**: Per-exchange failures reported by a channel adapter. They are
//!   returned to whoever issued the exchange and never swallowed by the master.
//! - **`Peripheral`**: A peripheral driver failed during bring-up or while running.
//!   Carries the peripheral's name and the driver's own error.
//! - **`Malformed`**: A board response could not be decoded.
//!
//! Peripheral drivers themselves return `anyhow::Result`, so any `MdbError` raised by
//! `send`/`sendread` can be propagated from a driver with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the bus error type.
pub type AppResult<T> = std::result::Result<T, MdbError>;

/// Errors produced by the bus master and its channel adapters.
#[derive(Error, Debug)]
pub enum MdbError {
    /// `send`/`sendread` or a fan-out call was issued before the session was established.
    #[error("Bus master used before the session was established")]
    NotEstablished,

    /// The sniffer was run before its `initialize` succeeded.
    #[error("Sniffer used before it was initialized")]
    SnifferNotInitialized,

    /// The board did not acknowledge the request to become bus master.
    #[error("Unable to start master mode on MDB board, got '{response}'")]
    Mastership {
        /// The raw response received instead of the acknowledgement.
        response: String,
    },

    /// Generic channel failure (closed connection, stopped reader, write failure).
    #[error("Channel error: {0}")]
    Channel(String),

    /// I/O failure on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No response of the expected type arrived in time.
    #[error("Timed out after {after:?} waiting for a response with prefix '{prefix}'")]
    Timeout {
        /// The response prefix that was awaited.
        prefix: String,
        /// How long the channel waited.
        after: Duration,
    },

    /// A response arrived but did not begin with the expected prefix.
    #[error("Expected a response starting with '{expected}', got '{response}'")]
    PrefixMismatch {
        /// The prefix the caller asked for.
        expected: String,
        /// The response that was actually received.
        response: String,
    },

    /// Somebody is already waiting on, or listening to, this message type.
    #[error("Message type '{0}' already has a waiter or listener")]
    RoutingConflict(char),

    /// A command could not be encoded for the wire.
    #[error("Cannot encode command for the board: {0}")]
    Encoding(String),

    /// A peripheral driver failed during bring-up or while running.
    #[error("Peripheral '{name}' failed: {source}")]
    Peripheral {
        /// Name of the failing peripheral.
        name: String,
        /// The driver's error.
        #[source]
        source: anyhow::Error,
    },

    /// A board response could not be decoded.
    #[error("Malformed board message: {0}")]
    Malformed(String),
}

impl MdbError {
    /// Wrap a peripheral driver's failure with the peripheral's name.
    pub fn peripheral(name: impl Into<String>, source: anyhow::Error) -> Self {
        MdbError::Peripheral {
            name: name.into(),
            source,
        }
    }

    /// True for the per-exchange failures a channel adapter can report.
    pub fn is_channel_error(&self) -> bool {
        matches!(
            self,
            MdbError::Channel(_)
                | MdbError::Io(_)
                | MdbError::Timeout { .. }
                | MdbError::PrefixMismatch { .. }
                | MdbError::RoutingConflict(_)
                | MdbError::Encoding(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MdbError::Mastership {
            response: "x,NAK".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unable to start master mode on MDB board, got 'x,NAK'"
        );
    }

    #[test]
    fn test_peripheral_error_keeps_source() {
        let err = MdbError::peripheral("coin_acceptor", anyhow::anyhow!("jammed"));
        assert_eq!(err.to_string(), "Peripheral 'coin_acceptor' failed: jammed");
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_channel_error());
    }

    #[test]
    fn test_channel_error_classification() {
        let timeout = MdbError::Timeout {
            prefix: "p".into(),
            after: Duration::from_millis(5),
        };
        assert!(timeout.is_channel_error());
        assert!(MdbError::RoutingConflict('x').is_channel_error());
        assert!(!MdbError::NotEstablished.is_channel_error());
        assert!(!MdbError::SnifferNotInitialized.is_channel_error());
    }
}
