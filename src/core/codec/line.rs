//! Modem response line codec
//!
//! Reassembles the raw byte stream into newline-terminated lines and tags
//! each line with what it means for the session.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Lines longer than this are cut and emitted without waiting for a newline
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024;

const CONNECT: &str = "CONNECT";
const NO_CARRIER: &str = "NO CARRIER";

/// Classification of a received line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Carrier established (`CONNECT`, `CONNECT 33600`, ...)
    Connect,
    /// Carrier lost
    NoCarrier,
    /// Anything else: modem responses or remote chat text
    Generic,
}

/// One received line and its classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemLine {
    text: String,
    kind: LineKind,
}

impl ModemLine {
    /// Classify a line of text.
    ///
    /// Case-sensitive substring match; `CONNECT` is checked first.
    pub fn classify(text: impl Into<String>) -> Self {
        let text = text.into();
        let kind = if text.contains(CONNECT) {
            LineKind::Connect
        } else if text.contains(NO_CARRIER) {
            LineKind::NoCarrier
        } else {
            LineKind::Generic
        };
        Self { text, kind }
    }

    /// Line text without terminator or surrounding whitespace
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Line classification
    pub fn kind(&self) -> LineKind {
        self.kind
    }
}

/// Incremental line splitter and classifier.
///
/// Undecodable bytes become U+FFFD instead of failing. Blank lines are
/// dropped, since modems frame every response with `\r\n` on both sides.
#[derive(Debug)]
pub struct LineClassifier {
    buffer: BytesMut,
    max_length: usize,
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LineClassifier {
    /// Create a classifier with the default line length limit
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Create a classifier with a custom line length limit
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
            max_length: max_length.max(1),
        }
    }

    /// Feed a chunk of bytes and collect every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ModemLine> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(line) = next_line(&mut self.buffer, self.max_length) {
            lines.push(line);
        }
        lines
    }

    /// Bytes held back waiting for a terminator
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial line
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

fn next_line(buf: &mut BytesMut, max_length: usize) -> Option<ModemLine> {
    loop {
        let raw = match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => buf.split_to(pos + 1),
            None if buf.len() >= max_length => buf.split_to(max_length),
            None => return None,
        };

        let text = String::from_utf8_lossy(&raw);
        let text = text.trim();
        if !text.is_empty() {
            return Some(ModemLine::classify(text));
        }
    }
}

impl Decoder for LineClassifier {
    type Item = ModemLine;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(next_line(src, self.max_length))
    }
}
