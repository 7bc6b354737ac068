//! Byte channel layer underneath the modem session
//!
//! Provides:
//! - `ByteChannel`, the narrow read/write/close interface the session engine
//!   and the XMODEM engine are written against
//! - `StreamChannel`, an implementation over any tokio byte stream
//!   (serial ports, in-memory loopback pairs)
//! - Serial port configuration and opening

mod serial;
mod stream;

pub use serial::{list_ports, SerialConfig, SerialFlowControl, SerialOpener, SerialParity};
pub use stream::StreamChannel;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Channel error types
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Opening the port failed
    #[error("Cannot open {port}: {reason}")]
    Open {
        /// Port name
        port: String,
        /// Underlying cause
        reason: String,
    },

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// I/O error on an open channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel was closed, locally or by the other end
    #[error("Channel closed")]
    Closed,
}

/// Bidirectional byte stream shared by the receive loop, the control path
/// and file transfers.
///
/// Methods take `&self` so one `Arc<dyn ByteChannel>` can be used from
/// several tasks. Only one logical writer may be active at a time; that is a
/// caller discipline enforced by the session controller, not by the channel.
#[async_trait]
pub trait ByteChannel: Send + Sync {
    /// Port or endpoint name
    fn name(&self) -> &str;

    /// Read up to `max` bytes, waiting at most `timeout`.
    ///
    /// Returns an empty buffer when nothing arrived in time. Fails with
    /// [`ChannelError::Closed`] once the channel is closed.
    async fn read(&self, max: usize, timeout: Duration) -> Result<Bytes, ChannelError>;

    /// Write all of `data` and flush it, returning the byte count
    async fn write(&self, data: &[u8]) -> Result<usize, ChannelError>;

    /// Close the channel. Pending and later reads and writes fail with
    /// [`ChannelError::Closed`]. Closing twice is a no-op.
    async fn close(&self);

    /// Check if the channel is still open
    fn is_open(&self) -> bool;

    /// Bytes already received and buffered, readable without waiting
    fn bytes_available(&self) -> usize;
}

/// Opens channels by port name
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open `port` at `baud_rate`
    async fn open(&self, port: &str, baud_rate: u32) -> Result<Arc<dyn ByteChannel>, ChannelError>;
}
