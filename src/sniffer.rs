//! Passive bus sniffer.
//!
//! The MDB board can mirror all bus traffic it observes as `x,...` lines. The
//! sniffer switches that mode on, logs every sniffed frame and switches it off
//! again on shutdown. It talks to the [`SerialChannel`] directly because it
//! needs a long-lived listener queue, which only the serial channel offers.

use crate::adapters::{to_ascii, Channel, SerialChannel};
use crate::error::{AppResult, MdbError};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn, Instrument, Span};

/// Command switching sniff mode on
pub const SNIFF_ENABLE_COMMAND: &str = "X,1";

/// Command switching sniff mode off
pub const SNIFF_DISABLE_COMMAND: &str = "X,0";

/// Expected acknowledgement of [`SNIFF_ENABLE_COMMAND`]
pub const SNIFF_ACK: &str = "x,ACK";

/// Message type of sniffed traffic and sniff-mode replies
pub const SNIFF_MESSAGE_TYPE: char = 'x';

const SNIFF_RESPONSE_PREFIX: &str = "x";

/// Split a sniffed line into its fields, dropping the message type
///
/// ```
/// use mdb_master::sniffer::parse_sniffed;
///
/// assert_eq!(parse_sniffed("x,30,00"), vec!["30", "00"]);
/// ```
pub fn parse_sniffed(line: &str) -> Vec<&str> {
    line.split(',').skip(1).collect()
}

/// Logs all bus traffic mirrored by the board
pub struct Sniffer {
    channel: Option<SerialChannel>,
    queue: Option<UnboundedReceiver<String>>,
    sniffed: usize,
    span: Span,
}

impl Default for Sniffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sniffer {
    /// Create an idle sniffer
    pub fn new() -> Self {
        Self {
            channel: None,
            queue: None,
            sniffed: 0,
            span: tracing::info_span!("sniffer"),
        }
    }

    /// Switch the board into sniff mode and start listening for `x` lines
    ///
    /// A reply other than `x,ACK` is only logged; the board still mirrors traffic.
    ///
    /// # Errors
    /// Channel errors from the `X,1` exchange, or [`MdbError::RoutingConflict`]
    /// if someone else already listens to `x` lines.
    pub async fn initialize(&mut self, channel: &SerialChannel) -> AppResult<()> {
        let span = self.span.clone();
        async {
            debug!("Initializing MDB sniffer.");
            let mut channel = channel.clone();
            let command = to_ascii(SNIFF_ENABLE_COMMAND)?;
            let status = match channel
                .transmit_and_await(&command, SNIFF_RESPONSE_PREFIX)
                .await
            {
                Ok(status) => status,
                Err(MdbError::PrefixMismatch { response, .. }) => response,
                Err(e) => return Err(e),
            };
            if status != SNIFF_ACK {
                warn!("Got something other than ACK: {}", status);
            }

            self.queue = Some(channel.listen(SNIFF_MESSAGE_TYPE)?);
            self.channel = Some(channel);
            debug!("Sniffer initialized");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Whether `initialize` succeeded and `shutdown` has not run yet
    pub fn is_initialized(&self) -> bool {
        self.channel.is_some()
    }

    /// Number of frames logged so far
    pub fn sniffed(&self) -> usize {
        self.sniffed
    }

    /// Log sniffed frames until the channel stops delivering them
    ///
    /// # Errors
    /// [`MdbError::SnifferNotInitialized`] if called before `initialize`
    pub async fn run(&mut self) -> AppResult<()> {
        let Sniffer {
            queue,
            sniffed,
            span,
            ..
        } = self;
        let queue = queue.as_mut().ok_or(MdbError::SnifferNotInitialized)?;
        async {
            while let Some(line) = queue.recv().await {
                debug!(fields = ?parse_sniffed(&line), "Message sniffed");
                *sniffed += 1;
            }
            debug!("Sniffed message queue closed");
        }
        .instrument(span.clone())
        .await;
        Ok(())
    }

    /// Stop listening and switch sniff mode off; a no-op if never initialized
    pub async fn shutdown(&mut self) -> AppResult<()> {
        let Some(mut channel) = self.channel.take() else {
            return Ok(());
        };
        let span = self.span.clone();
        async {
            info!("Shutting down.");
            channel.unlisten(SNIFF_MESSAGE_TYPE);
            self.queue = None;
            let command = to_ascii(SNIFF_DISABLE_COMMAND)?;
            channel
                .transmit_and_await(&command, SNIFF_RESPONSE_PREFIX)
                .await?;
            info!("Shutdown complete.");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
