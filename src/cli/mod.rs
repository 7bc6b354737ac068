//! CLI Module
//!
//! Provides command-line interface functionality including:
//! - Exit codes for automation
//! - Interactive console commands and notification formatting

pub mod console;
pub mod exit_codes;

pub use console::{format_event, parse_console_line, ConsoleCommand};
pub use exit_codes::{exit_code_description, CliResult, ExitCodes};
