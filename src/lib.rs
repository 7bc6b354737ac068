//! # Modemlink Core Library
//!
//! Drives a serial-attached modem and moves files over the call:
//! - AT command mode and data mode tracking from the modem's own responses
//! - Dial / answer / hang up and free-form lines in either mode
//! - XMODEM (checksum) send and receive over the established link
//! - Operator notifications through a pluggable sink
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use modemlink_core::{EventSink, SerialOpener, SessionController, SessionSettings, XmodemConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (sink, mut events) = EventSink::channel();
//!     let controller = SessionController::new(
//!         SessionSettings::default(),
//!         XmodemConfig::default(),
//!         Arc::new(SerialOpener::default()),
//!         Arc::new(sink),
//!     );
//!
//!     controller.connect("/dev/ttyUSB0", 9600).await?;
//!     controller.dial("5551234").await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{AppConfig, ConfigError, LoggingConfig};
pub use crate::core::codec::{LineClassifier, LineEnding, LineKind, ModemLine};
pub use crate::core::logger::TranscriptLogger;
pub use crate::core::notify::{EventSink, LogCategory, NotificationSink, SessionEvent, TracingSink};
pub use crate::core::session::{SessionController, SessionError, SessionSettings};
pub use crate::core::state_machine::{Capabilities, ModemCommand, ModemEvent, ModemStateMachine, Reaction, SessionState};
pub use crate::core::transfer::{
    TransferDirection, TransferError, TransferOutcome, TransferProgress, TransferRequest, TransferState,
    TransferSummary, XmodemConfig, XmodemEngine,
};
pub use crate::core::transport::{
    list_ports, ByteChannel, ChannelError, PortOpener, SerialConfig, SerialOpener, StreamChannel,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
