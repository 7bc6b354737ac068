//! File transfer over the modem link
//!
//! Implements XMODEM (128-byte blocks with additive checksum) and the value
//! types shared between the transfer engine, the session controller and
//! notification sinks.

pub mod xmodem;

pub use xmodem::{Block, BlockError, XmodemConfig, XmodemEngine, BLOCK_SIZE, FRAME_LEN};

use super::transport::ChannelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Local file to remote
    Send,
    /// Remote to local file
    Receive,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// One file transfer to run on the active session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Direction
    pub direction: TransferDirection,
    /// File to read from or write to
    pub path: PathBuf,
}

impl TransferRequest {
    /// Send `path` to the remote side
    pub fn send(path: impl Into<PathBuf>) -> Self {
        Self {
            direction: TransferDirection::Send,
            path: path.into(),
        }
    }

    /// Receive into `path`
    pub fn receive(path: impl Into<PathBuf>) -> Self {
        Self {
            direction: TransferDirection::Receive,
            path: path.into(),
        }
    }

    /// File name for display
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Waiting for the other side to start
    WaitingForStart,
    /// Blocks are moving
    InProgress,
    /// EOT acknowledged
    Complete,
}

/// Transfer progress info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Current state
    pub state: TransferState,
    /// Direction
    pub direction: TransferDirection,
    /// Display name of the file
    pub file_name: String,
    /// Bytes acknowledged so far (on receive, padding included)
    pub bytes_transferred: u64,
    /// Blocks acknowledged so far
    pub block_number: u32,
    /// Retries spent so far, all blocks
    pub retry_count: u32,
}

impl TransferProgress {
    /// Fresh progress record
    pub fn new(direction: TransferDirection, file_name: &str) -> Self {
        Self {
            state: TransferState::WaitingForStart,
            direction,
            file_name: file_name.to_string(),
            bytes_transferred: 0,
            block_number: 0,
            retry_count: 0,
        }
    }
}

/// Totals of a finished transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    /// Blocks acknowledged
    pub blocks: u32,
    /// Bytes moved: source bytes on send, written bytes (padding included) on receive
    pub bytes: u64,
    /// Retries over the whole transfer
    pub retries: u32,
}

/// Error category, as reported to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The physical channel failed
    PortError,
    /// No response within the budget
    Timeout,
    /// Bad framing, unexpected control byte or retries used up
    ProtocolFailure,
    /// The channel was closed while the transfer ran
    ChannelClosed,
    /// Local file could not be read or written
    File,
}

/// Transfer error types
#[derive(Error, Debug)]
pub enum TransferError {
    /// No response within the budget
    #[error("Timed out waiting for the remote side")]
    Timeout,

    /// One block (or the EOT) was refused too many times
    #[error("Block {block}: gave up after {retries} retries")]
    RetriesExhausted {
        /// Sequence number of the failing block (0 for EOT)
        block: u8,
        /// Retries spent
        retries: u32,
    },

    /// Malformed or out-of-order data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote side sent CAN
    #[error("Transfer cancelled by remote side")]
    Cancelled,

    /// The channel was closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Channel I/O failed
    #[error("Channel error: {0}")]
    Channel(ChannelError),

    /// Local file error
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Error category
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::Timeout,
            Self::RetriesExhausted { .. } | Self::Protocol(_) | Self::Cancelled => {
                ErrorKind::ProtocolFailure
            }
            Self::ChannelClosed => ErrorKind::ChannelClosed,
            Self::Channel(_) => ErrorKind::PortError,
            Self::Io(_) => ErrorKind::File,
        }
    }
}

impl From<ChannelError> for TransferError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Closed => Self::ChannelClosed,
            other => Self::Channel(other),
        }
    }
}

/// Result of a finished transfer
#[derive(Debug)]
pub enum TransferOutcome {
    /// EOT acknowledged; file complete
    Success(TransferSummary),
    /// Aborted; nothing committed beyond what was already flushed
    Failure(TransferError),
}

impl TransferOutcome {
    /// True for `Success`
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Error, if any
    pub fn error(&self) -> Option<&TransferError> {
        match self {
            Self::Success(_) => None,
            Self::Failure(err) => Some(err),
        }
    }
}

impl From<Result<TransferSummary, TransferError>> for TransferOutcome {
    fn from(result: Result<TransferSummary, TransferError>) -> Self {
        match result {
            Ok(summary) => Self::Success(summary),
            Err(err) => Self::Failure(err),
        }
    }
}
