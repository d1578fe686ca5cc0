//! Board message envelope for peripheral traffic
//!
//! Peripheral drivers do not talk raw MDB bytes to the USB board; they wrap each
//! command in a text envelope and the board wraps the peripheral's reply:
//!
//! - Request: `R,<address-command byte hex>[,<payload hex>]`
//! - Response: `p,ACK`, `p,NACK` or `p,<data hex>`
//!
//! Device command sets (bill validator, coin acceptor) are left to the drivers.

use crate::error::{AppResult, MdbError};
use std::fmt;

/// Message type of every peripheral response produced by the board.
pub const BOARD_RESPONSE_PREFIX: &str = "p";

const BOARD_MESSAGE_PREFIX: &str = "R";

/// A command addressed to one peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessage {
    /// Combined MDB address/command byte
    pub address: u8,
    /// Optional command payload
    pub payload: Vec<u8>,
}

impl RequestMessage {
    /// Command without payload
    pub fn new(address: u8) -> Self {
        Self {
            address,
            payload: Vec::new(),
        }
    }

    /// Command carrying `payload`
    pub fn with_payload(address: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            payload: payload.into(),
        }
    }

    /// Render the board envelope, terminator included
    ///
    /// # Example
    ///
    /// ```
    /// use mdb_master::message::RequestMessage;
    ///
    /// assert_eq!(RequestMessage::new(0x33).pack(), "R,33\n");
    /// assert_eq!(RequestMessage::with_payload(0x34, [0x00, 0xff]).pack(), "R,34,00ff\n");
    /// ```
    pub fn pack(&self) -> String {
        let mut packed = format!("{},{:02x}", BOARD_MESSAGE_PREFIX, self.address);
        if !self.payload.is_empty() {
            packed.push(',');
            packed.push_str(&to_hex(&self.payload));
        }
        packed.push('\n');
        packed
    }
}

impl fmt::Display for RequestMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(address_byte: {:02x}", self.address)?;
        if !self.payload.is_empty() {
            write!(f, ", payload: {}", to_hex(&self.payload))?;
        }
        write!(f, ")")
    }
}

/// A peripheral's reply as relayed by the board
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMessage {
    /// Peripheral acknowledged without data
    Ack,
    /// Peripheral refused or did not answer in time
    Nack,
    /// Peripheral returned data
    Data(Vec<u8>),
}

impl ResponseMessage {
    /// Decode a raw board line such as `p,ACK` or `p,0933`
    ///
    /// # Errors
    /// [`MdbError::Malformed`] when the line is too short or carries invalid hex.
    pub fn unpack(message: &str) -> AppResult<Self> {
        let body = message
            .get(2..)
            .ok_or_else(|| MdbError::Malformed(format!("response too short: '{}'", message)))?;

        match body {
            "ACK" => Ok(ResponseMessage::Ack),
            "NACK" => Ok(ResponseMessage::Nack),
            data => from_hex(data)
                .map(ResponseMessage::Data)
                .ok_or_else(|| MdbError::Malformed(format!("invalid hex data in '{}'", message))),
        }
    }

    /// True for [`ResponseMessage::Ack`]
    pub fn is_ack(&self) -> bool {
        matches!(self, ResponseMessage::Ack)
    }

    /// True for [`ResponseMessage::Nack`]
    pub fn is_nack(&self) -> bool {
        matches!(self, ResponseMessage::Nack)
    }

    /// Payload bytes, if any
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            ResponseMessage::Data(data) => Some(data),
            _ => None,
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.is_empty() || text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}
