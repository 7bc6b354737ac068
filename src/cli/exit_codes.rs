//! CLI Exit Codes
//!
//! Process exit codes for scripted use of the binary.

use crate::config::ConfigError;
use crate::core::session::SessionError;
use crate::core::transfer::{ErrorKind, TransferError};
use crate::core::transport::ChannelError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Timed out waiting for the other side
    pub const TIMEOUT: u8 = 4;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Protocol error
    pub const PROTOCOL_ERROR: u8 = 9;

    /// Transfer failed
    pub const TRANSFER_FAILED: u8 = 10;

    /// Cancelled by the remote side or the operator
    pub const CANCELLED: u8 = 11;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message for the operator
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            _ => ExitCodes::ERROR,
        };

        Self::Error(code, err.to_string())
    }
}

impl From<ChannelError> for CliResult {
    fn from(err: ChannelError) -> Self {
        let code = match err {
            ChannelError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
            ChannelError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            _ => ExitCodes::CONNECTION_FAILED,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<SessionError> for CliResult {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Channel(e) => e.into(),
            other => Self::Error(ExitCodes::ERROR, other.to_string()),
        }
    }
}

impl From<TransferError> for CliResult {
    fn from(err: TransferError) -> Self {
        let code = match (&err, err.kind()) {
            (TransferError::Cancelled, _) => ExitCodes::CANCELLED,
            (TransferError::Io(e), _) if e.kind() == std::io::ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
            (_, ErrorKind::Timeout) => ExitCodes::TIMEOUT,
            (_, ErrorKind::ProtocolFailure) => ExitCodes::PROTOCOL_ERROR,
            (_, ErrorKind::PortError | ErrorKind::ChannelClosed) => ExitCodes::CONNECTION_FAILED,
            (_, ErrorKind::File) => ExitCodes::TRANSFER_FAILED,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Timed out",
        6 => "File not found",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        10 => "Transfer failed",
        11 => "Cancelled",
        14 => "Port not found",
        127 => "Internal error",
        _ => "Unknown error",
    }
}
