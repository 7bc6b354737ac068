//! Core module containing the modem session engine
//!
//! This module provides:
//! - Byte channels over serial ports and in-memory streams
//! - Line reassembly and classification of modem responses
//! - The command mode / data mode state machine
//! - XMODEM file transfer
//! - Operator notifications and session transcripts
//! - The session controller tying it together

pub mod codec;
pub mod logger;
pub mod notify;
pub mod session;
pub mod state_machine;
pub mod transfer;
pub mod transport;
