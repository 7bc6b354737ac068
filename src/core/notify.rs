//! Operator notifications
//!
//! The session controller reports everything the operator should see through
//! a [`NotificationSink`]. Sinks are called from the receive and transfer
//! tasks and must return quickly.

use super::state_machine::SessionState;
use super::transfer::{TransferDirection, TransferOutcome, TransferProgress, TransferSummary};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Kind of operator log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogCategory {
    /// Lifecycle messages
    Info,
    /// Text written to the modem
    Sent,
    /// Modem responses in command mode
    ModemResponse,
    /// Remote party text in data mode
    RemoteChat,
    /// File transfer messages
    Transfer,
    /// Failures
    Error,
}

impl LogCategory {
    /// Short label for transcripts and the console
    pub fn label(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Sent => "TX",
            Self::ModemResponse => "MODEM",
            Self::RemoteChat => "REMOTE",
            Self::Transfer => "XFER",
            Self::Error => "ERROR",
        }
    }
}

/// Receiver of operator notifications
pub trait NotificationSink: Send + Sync {
    /// A log line
    fn on_log(&self, text: &str, category: LogCategory);

    /// The session moved to `state`
    fn on_state_change(&self, state: SessionState);

    /// A transfer made progress
    fn on_transfer_progress(&self, _progress: &TransferProgress) {}

    /// A transfer finished
    fn on_transfer_outcome(&self, direction: TransferDirection, outcome: &TransferOutcome);
}

impl<T: NotificationSink + ?Sized> NotificationSink for Arc<T> {
    fn on_log(&self, text: &str, category: LogCategory) {
        (**self).on_log(text, category);
    }

    fn on_state_change(&self, state: SessionState) {
        (**self).on_state_change(state);
    }

    fn on_transfer_progress(&self, progress: &TransferProgress) {
        (**self).on_transfer_progress(progress);
    }

    fn on_transfer_outcome(&self, direction: TransferDirection, outcome: &TransferOutcome) {
        (**self).on_transfer_outcome(direction, outcome);
    }
}

/// Fan out to both sinks, first then second
impl<A: NotificationSink, B: NotificationSink> NotificationSink for (A, B) {
    fn on_log(&self, text: &str, category: LogCategory) {
        self.0.on_log(text, category);
        self.1.on_log(text, category);
    }

    fn on_state_change(&self, state: SessionState) {
        self.0.on_state_change(state);
        self.1.on_state_change(state);
    }

    fn on_transfer_progress(&self, progress: &TransferProgress) {
        self.0.on_transfer_progress(progress);
        self.1.on_transfer_progress(progress);
    }

    fn on_transfer_outcome(&self, direction: TransferDirection, outcome: &TransferOutcome) {
        self.0.on_transfer_outcome(direction, outcome);
        self.1.on_transfer_outcome(direction, outcome);
    }
}

/// Session events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Operator log line
    Log {
        /// Log text
        text: String,
        /// Log category
        category: LogCategory,
    },
    /// State changed
    StateChanged(SessionState),
    /// Transfer progress
    TransferProgress(TransferProgress),
    /// Transfer finished
    TransferFinished {
        /// Direction
        direction: TransferDirection,
        /// Totals, or the error message
        result: Result<TransferSummary, String>,
    },
}

/// Sink that forwards notifications as [`SessionEvent`]s over a channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    /// Create a sink and the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: SessionEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl NotificationSink for EventSink {
    fn on_log(&self, text: &str, category: LogCategory) {
        self.emit(SessionEvent::Log {
            text: text.to_string(),
            category,
        });
    }

    fn on_state_change(&self, state: SessionState) {
        self.emit(SessionEvent::StateChanged(state));
    }

    fn on_transfer_progress(&self, progress: &TransferProgress) {
        self.emit(SessionEvent::TransferProgress(progress.clone()));
    }

    fn on_transfer_outcome(&self, direction: TransferDirection, outcome: &TransferOutcome) {
        let result = match outcome {
            TransferOutcome::Success(summary) => Ok(*summary),
            TransferOutcome::Failure(err) => Err(err.to_string()),
        };
        self.emit(SessionEvent::TransferFinished { direction, result });
    }
}

/// Sink that turns notifications into `tracing` events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn on_log(&self, text: &str, category: LogCategory) {
        match category {
            LogCategory::Error => tracing::error!(category = category.label(), "{text}"),
            _ => tracing::info!(category = category.label(), "{text}"),
        }
    }

    fn on_state_change(&self, state: SessionState) {
        tracing::info!(state = %state, "session state changed");
    }

    fn on_transfer_progress(&self, progress: &TransferProgress) {
        tracing::debug!(
            file = %progress.file_name,
            block = progress.block_number,
            bytes = progress.bytes_transferred,
            retries = progress.retry_count,
            "transfer progress"
        );
    }

    fn on_transfer_outcome(&self, direction: TransferDirection, outcome: &TransferOutcome) {
        match outcome {
            TransferOutcome::Success(summary) => {
                tracing::info!(%direction, blocks = summary.blocks, bytes = summary.bytes, "transfer complete")
            }
            TransferOutcome::Failure(err) => tracing::warn!(%direction, error = %err, "transfer failed"),
        }
    }
}
