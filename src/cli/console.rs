//! Interactive console
//!
//! Typed lines go to the modem as-is; lines starting with `/` are local
//! commands. `//` sends a literal leading slash.

use crate::core::notify::SessionEvent;
use std::path::PathBuf;

/// Help shown by `/help`
pub const HELP: &str = "\
Commands:
  /dial NUMBER   dial (ATD)
  /answer        answer an incoming call (ATA)
  /hangup        hang up (ATH)
  /send PATH     send a file with XMODEM
  /recv PATH     receive a file with XMODEM
  /status        show session state
  /quit          disconnect and exit
Anything else is sent to the modem as typed.";

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Send text verbatim
    Line(String),
    /// Dial a number
    Dial(String),
    /// Answer
    Answer,
    /// Hang up
    Hangup,
    /// Send a file
    Send(PathBuf),
    /// Receive a file
    Receive(PathBuf),
    /// Show state
    Status,
    /// Show help
    Help,
    /// Leave the console
    Quit,
    /// Unusable input, with a message for the operator
    Invalid(String),
}

/// Parse one line of operator input. Blank input yields `None`.
pub fn parse_console_line(input: &str) -> Option<ConsoleCommand> {
    let input = input.trim_end_matches(['\r', '\n']);
    if input.trim().is_empty() {
        return None;
    }

    if let Some(escaped) = input.strip_prefix("//") {
        return Some(ConsoleCommand::Line(format!("/{escaped}")));
    }
    let Some(command) = input.strip_prefix('/') else {
        return Some(ConsoleCommand::Line(input.to_string()));
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };

    let parsed = match (name, arg.is_empty()) {
        ("dial" | "d", false) => ConsoleCommand::Dial(arg.to_string()),
        ("dial" | "d", true) => ConsoleCommand::Invalid("usage: /dial NUMBER".into()),
        ("answer" | "a", _) => ConsoleCommand::Answer,
        ("hangup" | "h", _) => ConsoleCommand::Hangup,
        ("send" | "s", false) => ConsoleCommand::Send(PathBuf::from(arg)),
        ("send" | "s", true) => ConsoleCommand::Invalid("usage: /send PATH".into()),
        ("recv" | "receive" | "r", false) => ConsoleCommand::Receive(PathBuf::from(arg)),
        ("recv" | "receive" | "r", true) => ConsoleCommand::Invalid("usage: /recv PATH".into()),
        ("status", _) => ConsoleCommand::Status,
        ("help" | "?", _) => ConsoleCommand::Help,
        ("quit" | "exit" | "q", _) => ConsoleCommand::Quit,
        (other, _) => ConsoleCommand::Invalid(format!("unknown command /{other}, try /help")),
    };
    Some(parsed)
}

/// Render a session event for the console, if it should be shown
pub fn format_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::Log { text, category } => Some(format!("[{}] {}", category.label(), text)),
        SessionEvent::StateChanged(state) => Some(format!("[STATE] {state}")),
        SessionEvent::TransferProgress(progress) if progress.block_number > 0 => Some(format!(
            "[XFER] {} block {} ({} bytes, {} retries)",
            progress.file_name, progress.block_number, progress.bytes_transferred, progress.retry_count
        )),
        // Outcomes are also logged as text
        SessionEvent::TransferProgress(_) | SessionEvent::TransferFinished { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::notify::LogCategory;
    use crate::core::state_machine::SessionState;
    use crate::core::transfer::{TransferDirection, TransferProgress};

    #[test]
    fn test_plain_lines() {
        assert_eq!(parse_console_line("ATZ\n"), Some(ConsoleCommand::Line("ATZ".into())));
        assert_eq!(parse_console_line("  hello  "), Some(ConsoleCommand::Line("  hello  ".into())));
        assert_eq!(parse_console_line("//etc"), Some(ConsoleCommand::Line("/etc".into())));
        assert_eq!(parse_console_line(""), None);
        assert_eq!(parse_console_line("   \r\n"), None);
    }

    #[test]
    fn test_slash_commands() {
        assert_eq!(parse_console_line("/dial 5551234"), Some(ConsoleCommand::Dial("5551234".into())));
        assert_eq!(parse_console_line("/answer"), Some(ConsoleCommand::Answer));
        assert_eq!(parse_console_line("/hangup"), Some(ConsoleCommand::Hangup));
        assert_eq!(
            parse_console_line("/send  /tmp/a b.txt"),
            Some(ConsoleCommand::Send(PathBuf::from("/tmp/a b.txt")))
        );
        assert_eq!(parse_console_line("/recv in.bin"), Some(ConsoleCommand::Receive(PathBuf::from("in.bin"))));
        assert_eq!(parse_console_line("/status"), Some(ConsoleCommand::Status));
        assert_eq!(parse_console_line("/quit"), Some(ConsoleCommand::Quit));
    }

    #[test]
    fn test_invalid_commands() {
        assert!(matches!(parse_console_line("/dial"), Some(ConsoleCommand::Invalid(_))));
        assert!(matches!(parse_console_line("/send"), Some(ConsoleCommand::Invalid(_))));
        assert!(matches!(parse_console_line("/frobnicate"), Some(ConsoleCommand::Invalid(m)) if m.contains("frobnicate")));
    }

    #[test]
    fn test_format_event() {
        let log = SessionEvent::Log {
            text: "Remote: hi".into(),
            category: LogCategory::RemoteChat,
        };
        assert_eq!(format_event(&log).unwrap(), "[REMOTE] Remote: hi");
        assert_eq!(
            format_event(&SessionEvent::StateChanged(SessionState::DataMode)).unwrap(),
            "[STATE] Data mode"
        );

        let mut progress = TransferProgress::new(TransferDirection::Send, "a.bin");
        assert!(format_event(&SessionEvent::TransferProgress(progress.clone())).is_none());
        progress.block_number = 2;
        progress.bytes_transferred = 256;
        assert_eq!(
            format_event(&SessionEvent::TransferProgress(progress)).unwrap(),
            "[XFER] a.bin block 2 (256 bytes, 0 retries)"
        );
    }
}
