//! Modem session state machine
//!
//! Tracks whether the link is closed, talking to the modem (command mode) or
//! bridged to a remote party (data mode). Every (state, event) pair has a
//! defined outcome; the machine never performs I/O itself but returns the
//! reactions the session controller must carry out, in order.

use super::codec::{LineEnding, LineKind, ModemLine};
use super::notify::LogCategory;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No port open
    Closed,
    /// Port open, modem interprets input as AT commands
    CommandMode,
    /// Carrier up, bytes pass through to the remote party
    DataMode,
}

impl SessionState {
    /// Check if the port is open
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Closed)
    }

    /// Check if a call is established
    pub fn is_data_mode(&self) -> bool {
        matches!(self, Self::DataMode)
    }

    /// Operator actions allowed in this state
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::Closed => Capabilities::default(),
            Self::CommandMode => Capabilities {
                send: true,
                dial: true,
                hangup: false,
                transfer: false,
            },
            Self::DataMode => Capabilities {
                send: true,
                dial: false,
                hangup: true,
                transfer: true,
            },
        }
    }

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::CommandMode => "Command mode",
            Self::DataMode => "Data mode",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which operator controls should be enabled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Free-form line entry
    pub send: bool,
    /// Dial / answer
    pub dial: bool,
    /// Hang up
    pub hangup: bool,
    /// File transfer
    pub transfer: bool,
}

/// Operator command toward the modem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemCommand {
    /// `ATD<number>`
    Dial(String),
    /// `ATA`
    Answer,
    /// `ATH`
    Hangup,
    /// Any text, sent verbatim: AT commands or chat
    SendLine(String),
}

impl ModemCommand {
    /// Command text without line ending
    pub fn text(&self) -> String {
        match self {
            Self::Dial(number) => format!("ATD{number}"),
            Self::Answer => "ATA".to_string(),
            Self::Hangup => "ATH".to_string(),
            Self::SendLine(text) => text.clone(),
        }
    }

    /// Bytes put on the wire
    pub fn to_bytes(&self, line_ending: LineEnding) -> Vec<u8> {
        line_ending.terminate(&self.text())
    }
}

/// Input to the state machine
#[derive(Debug, Clone)]
pub enum ModemEvent {
    /// Port opened
    Opened {
        /// Port name
        port: String,
    },
    /// Line received from the modem
    Line(ModemLine),
    /// Operator command
    Command(ModemCommand),
    /// Channel I/O failed; the session is over
    ChannelFailed(String),
    /// Operator disconnected
    Disconnect,
}

/// Output of the state machine, to be carried out in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    /// Write bytes to the channel
    Write(Vec<u8>),
    /// Emit an operator log line
    Log {
        /// Log text
        text: String,
        /// Log category
        category: LogCategory,
    },
    /// State changed
    StateChanged(SessionState),
    /// Release the channel
    CloseChannel,
}

impl Reaction {
    fn log(text: impl Into<String>, category: LogCategory) -> Self {
        Self::Log {
            text: text.into(),
            category,
        }
    }
}

/// State transition record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: SessionState,
    /// New state
    pub to: SessionState,
    /// Timestamp
    pub timestamp: DateTime<Local>,
    /// Reason for transition
    pub reason: String,
}

/// Modem session state machine
#[derive(Debug)]
pub struct ModemStateMachine {
    state: SessionState,
    line_ending: LineEnding,
    history: Vec<StateTransition>,
    max_history: usize,
}

impl Default for ModemStateMachine {
    fn default() -> Self {
        Self::new(LineEnding::CrLf)
    }
}

impl ModemStateMachine {
    /// Create a machine in the `Closed` state
    pub fn new(line_ending: LineEnding) -> Self {
        Self {
            state: SessionState::Closed,
            line_ending,
            history: Vec::new(),
            max_history: 100,
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get state history, oldest first
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Feed one event and collect the reactions
    pub fn handle(&mut self, event: ModemEvent) -> Vec<Reaction> {
        use SessionState::{Closed, CommandMode, DataMode};

        match (self.state, event) {
            (Closed, ModemEvent::Opened { port }) => {
                let mut out = self.transition(CommandMode, "port opened");
                out.push(Reaction::log(format!("Connected to {port}"), LogCategory::Info));
                out
            }
            (_, ModemEvent::Opened { .. }) => Vec::new(),

            // Nothing is read while closed; late lines from a dying receive
            // loop are dropped.
            (Closed, ModemEvent::Line(_)) => Vec::new(),

            (CommandMode, ModemEvent::Line(line)) => match line.kind() {
                LineKind::Connect => {
                    let mut out = self.transition(DataMode, line.text());
                    out.push(Reaction::log("Connection established", LogCategory::Info));
                    out
                }
                LineKind::NoCarrier => {
                    vec![Reaction::log("Connection dropped", LogCategory::Info)]
                }
                LineKind::Generic => vec![Reaction::log(
                    format!("Received: {}", line.text()),
                    LogCategory::ModemResponse,
                )],
            },

            (DataMode, ModemEvent::Line(line)) => match line.kind() {
                LineKind::Connect => {
                    tracing::debug!(line = line.text(), "CONNECT while already in data mode");
                    Vec::new()
                }
                LineKind::NoCarrier => {
                    let mut out = self.transition(CommandMode, line.text());
                    out.push(Reaction::log("Connection dropped", LogCategory::Info));
                    out
                }
                LineKind::Generic => vec![Reaction::log(
                    format!("Remote: {}", line.text()),
                    LogCategory::RemoteChat,
                )],
            },

            (Closed, ModemEvent::Command(_)) => Vec::new(),
            (_, ModemEvent::Command(command)) => vec![
                Reaction::Write(command.to_bytes(self.line_ending)),
                Reaction::log(format!("Sent: {}", command.text()), LogCategory::Sent),
            ],

            (Closed, ModemEvent::ChannelFailed(_) | ModemEvent::Disconnect) => Vec::new(),
            (_, ModemEvent::ChannelFailed(reason)) => {
                let mut out = vec![Reaction::log(
                    format!("Connection error: {reason}"),
                    LogCategory::Error,
                )];
                out.extend(self.transition(Closed, &reason));
                out.push(Reaction::CloseChannel);
                out.push(Reaction::log("Disconnected.", LogCategory::Info));
                out
            }
            (_, ModemEvent::Disconnect) => {
                let mut out = self.transition(Closed, "operator disconnect");
                out.push(Reaction::CloseChannel);
                out.push(Reaction::log("Disconnected.", LogCategory::Info));
                out
            }
        }
    }

    fn transition(&mut self, to: SessionState, reason: &str) -> Vec<Reaction> {
        if self.state == to {
            return Vec::new();
        }

        tracing::debug!(from = ?self.state, to = ?to, reason, "session state transition");
        self.history.push(StateTransition {
            from: self.state,
            to,
            timestamp: Local::now(),
            reason: reason.to_string(),
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        self.state = to;
        vec![Reaction::StateChanged(to)]
    }
}
