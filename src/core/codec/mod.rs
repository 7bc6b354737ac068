//! Codecs for the modem line protocol
//!
//! - Line reassembly and classification of modem responses
//! - Line endings for outgoing commands

mod line;

pub use line::{LineClassifier, LineKind, ModemLine, DEFAULT_MAX_LINE_LENGTH};

use serde::{Deserialize, Serialize};

/// Line ending type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LineEnding {
    /// Carriage Return only
    Cr,
    /// Line Feed only
    Lf,
    /// Both CR and LF
    #[default]
    CrLf,
}

impl LineEnding {
    /// Get the byte sequence for this line ending
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Self::Cr => b"\r",
            Self::Lf => b"\n",
            Self::CrLf => b"\r\n",
        }
    }

    /// Append `text` and the line ending into a new buffer
    pub fn terminate(&self, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() + 2);
        out.extend_from_slice(text.as_bytes());
        out.extend_from_slice(self.bytes());
        out
    }
}
