//! Serial channel to the MDB USB board
//!
//! The board speaks a line-oriented ASCII protocol: commands go out terminated by
//! `\n`, every line coming back is terminated by `\r\n` and starts with a single
//! character naming its message type (`m` for master-mode replies, `p` for
//! peripheral responses, `x` for sniffed traffic, ...).
//!
//! A background reader task owns the read half of the stream and routes each line
//! by its message type:
//! 1. to the one caller currently waiting for that type (see
//!    [`Channel::transmit_and_await`]), otherwise
//! 2. to a long-lived listener queue registered with [`SerialChannel::listen`],
//!    otherwise
//! 3. it is logged as unhandled and dropped.
//!
//! Waiting for a type and listening to it at the same time is a routing conflict.

use super::Channel;
use crate::error::{AppResult, MdbError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Baud rate of the MDB USB board
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// How long to wait for a response before reporting a timeout
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A caller waiting for one line of a message type.
struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<String>,
}

/// Where incoming lines go, keyed by message type.
#[derive(Default)]
struct Routes {
    waiters: HashMap<char, Waiter>,
    listeners: HashMap<char, mpsc::UnboundedSender<String>>,
    next_ticket: u64,
    closed: bool,
}

impl Routes {
    fn register_waiter(&mut self, kind: char, tx: oneshot::Sender<String>) -> AppResult<u64> {
        self.ensure_free(kind)?;
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiters.insert(kind, Waiter { ticket, tx });
        Ok(ticket)
    }

    /// Drop the waiter for `kind` if it is still the one holding `ticket`
    fn release_waiter(&mut self, kind: char, ticket: u64) {
        if self
            .waiters
            .get(&kind)
            .is_some_and(|waiter| waiter.ticket == ticket)
        {
            self.waiters.remove(&kind);
        }
    }

    fn ensure_free(&self, kind: char) -> AppResult<()> {
        if self.closed {
            return Err(MdbError::Channel("MDB board reader has stopped".to_string()));
        }
        if self.waiters.contains_key(&kind) || self.listeners.contains_key(&kind) {
            return Err(MdbError::RoutingConflict(kind));
        }
        Ok(())
    }

    fn dispatch(&mut self, line: String) {
        let Some(kind) = line.chars().next() else {
            return;
        };

        if let Some(waiter) = self.waiters.remove(&kind) {
            if waiter.tx.send(line).is_err() {
                debug!("Waiter for message type {} went away", kind);
            }
            return;
        }

        let delivered = match self.listeners.get(&kind) {
            Some(listener) => listener.send(line).is_ok(),
            None => {
                error!("Unhandled message: {}", line);
                return;
            }
        };
        if !delivered {
            warn!("Listener for message type {} is gone, unregistering it", kind);
            self.listeners.remove(&kind);
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.waiters.clear();
        self.listeners.clear();
    }
}

fn lock(routes: &StdMutex<Routes>) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Channel adapter for the MDB USB board
///
/// Cheap to clone: clones share the writer, the routing table and the reader task.
#[derive(Clone)]
pub struct SerialChannel {
    writer: Arc<Mutex<BoxedWriter>>,
    routes: Arc<StdMutex<Routes>>,
    reader_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
    response_timeout: Duration,
    span: Span,
}

impl SerialChannel {
    /// Open the board's serial device
    ///
    /// # Arguments
    /// * `device_path` - Serial port path (e.g., "/dev/ttyUSB0")
    /// * `baud_rate` - Communication speed, normally [`DEFAULT_BAUD_RATE`]
    /// * `response_timeout` - How long `transmit_and_await` waits for a reply
    ///
    /// # Errors
    /// Returns [`MdbError::Channel`] if the port cannot be opened
    #[cfg(feature = "tokio_serial")]
    pub fn open(device_path: &str, baud_rate: u32, response_timeout: Duration) -> AppResult<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(device_path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                MdbError::Channel(format!(
                    "Failed to open MDB board at '{}' ({} baud): {}",
                    device_path, baud_rate, e
                ))
            })?;

        let channel = Self::from_stream(port, device_path, response_timeout);
        channel
            .span
            .in_scope(|| info!("Connected to serial device at {}.", device_path));
        Ok(channel)
    }

    /// Wrap an already-open byte stream and start the reader task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream<S>(stream: S, label: &str, response_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let span = tracing::info_span!("serial_channel", device = %label);
        let (read_half, write_half) = tokio::io::split(stream);
        let routes = Arc::new(StdMutex::new(Routes::default()));

        let reader = tokio::spawn(
            read_loop(BufReader::new(read_half), routes.clone()).instrument(span.clone()),
        );

        Self {
            writer: Arc::new(Mutex::new(Box::new(write_half))),
            routes,
            reader_task: Arc::new(StdMutex::new(Some(reader))),
            response_timeout,
            span,
        }
    }

    /// Deliver every line of message type `kind` to the returned queue
    ///
    /// # Errors
    /// [`MdbError::RoutingConflict`] if somebody already waits on or listens to `kind`
    pub fn listen(&self, kind: char) -> AppResult<mpsc::UnboundedReceiver<String>> {
        let mut routes = lock(&self.routes);
        routes.ensure_free(kind)?;
        let (tx, rx) = mpsc::unbounded_channel();
        routes.listeners.insert(kind, tx);
        self.span
            .in_scope(|| info!("Polling for messages of type: {}", kind));
        Ok(rx)
    }

    /// Stop delivering message type `kind` to its listener queue
    pub fn unlisten(&self, kind: char) {
        if lock(&self.routes).listeners.remove(&kind).is_some() {
            self.span
                .in_scope(|| info!("No longer polling for message type: {}", kind));
        }
    }

    /// Stop the reader task; pending and future exchanges fail
    pub fn shutdown(&self) {
        self.span.in_scope(|| info!("Shutting down."));
        if let Some(reader) = self
            .reader_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            reader.abort();
        }
        lock(&self.routes).close();
    }

    async fn write(&self, message: &[u8]) -> AppResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(message).await?;
        writer.flush().await?;
        debug!(
            "Sent message to MDB board: {}",
            String::from_utf8_lossy(message).trim_end()
        );
        Ok(())
    }

    async fn exchange(&self, message: &[u8], expected_prefix: &str) -> AppResult<String> {
        let kind = expected_prefix
            .chars()
            .next()
            .ok_or_else(|| MdbError::Channel("Expected response prefix is empty".to_string()))?;

        let (tx, rx) = oneshot::channel();
        let ticket = lock(&self.routes).register_waiter(kind, tx)?;
        // Unregisters on every exit, including when this future is dropped.
        let _waiter = WaiterGuard {
            routes: &self.routes,
            kind,
            ticket,
        };

        self.write(message).await?;

        debug!("Waiting for a single message of type: {}", kind);
        let response = match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(MdbError::Channel(
                    "MDB board reader stopped while waiting for a response".to_string(),
                ))
            }
            Err(_) => {
                warn!(
                    "No response of type {} within {:?}",
                    kind, self.response_timeout
                );
                return Err(MdbError::Timeout {
                    prefix: expected_prefix.to_string(),
                    after: self.response_timeout,
                });
            }
        };

        debug!("Got message: {}", response);
        if !response.starts_with(expected_prefix) {
            return Err(MdbError::PrefixMismatch {
                expected: expected_prefix.to_string(),
                response,
            });
        }
        Ok(response)
    }
}

struct WaiterGuard<'a> {
    routes: &'a StdMutex<Routes>,
    kind: char,
    ticket: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock(self.routes).release_waiter(self.kind, self.ticket);
    }
}

async fn read_loop<R>(mut reader: R, routes: Arc<StdMutex<Routes>>)
where
    R: AsyncBufRead + Unpin,
{
    info!("Starting runner.");
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                warn!("MDB board closed the connection.");
                break;
            }
            Ok(_) => {
                let Ok(line) = std::str::from_utf8(&buf) else {
                    warn!("Discarding undecodable line from MDB board: {:02x?}", buf);
                    continue;
                };
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                debug!("Read '{}' from MDB board.", line);
                lock(&routes).dispatch(line.to_string());
            }
            Err(e) => {
                error!("Reading from MDB board failed: {}", e);
                break;
            }
        }
    }
    lock(&routes).close();
}

#[async_trait]
impl Channel for SerialChannel {
    async fn transmit(&mut self, message: &[u8]) -> AppResult<()> {
        self.write(message).instrument(self.span.clone()).await
    }

    async fn transmit_and_await(
        &mut self,
        message: &[u8],
        expected_prefix: &str,
    ) -> AppResult<String> {
        self.exchange(message, expected_prefix)
            .instrument(self.span.clone())
            .await
    }
}
