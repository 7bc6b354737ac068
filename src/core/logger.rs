//! Session transcript
//!
//! Appends every operator log line to a text file as
//! `[timestamp] LABEL text`.

use super::notify::{LogCategory, NotificationSink};
use super::state_machine::SessionState;
use super::transfer::{TransferDirection, TransferOutcome};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const FLUSH_EVERY: usize = 100;

/// Format one transcript line
pub fn format_entry(timestamp: DateTime<Local>, category: LogCategory, text: &str) -> String {
    format!(
        "[{}] {} {}",
        timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        category.label(),
        text
    )
}

/// Transcript file name with a timestamp, e.g. `modemlink_20240101_120000.log`
pub fn generate_transcript_filename(prefix: &str) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.log", prefix, timestamp)
}

struct Writer {
    file: BufWriter<File>,
    lines: usize,
}

/// On-disk session transcript.
///
/// Entries from different tasks are serialized by an internal lock, so lines
/// never interleave.
///
/// Writes go through a `BufWriter` and reach the file on every 100th line,
/// so `on_log` only touches the disk on those flushes. Those flushes are
/// blocking `std::fs` I/O on the calling task.
pub struct TranscriptLogger {
    path: PathBuf,
    writer: Mutex<Writer>,
}

impl std::fmt::Debug for TranscriptLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptLogger")
            .field("path", &self.path)
            .field("lines", &self.writer.lock().lines)
            .finish()
    }
}

impl TranscriptLogger {
    /// Open `path` for appending, creating it if needed
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(Writer {
                file: BufWriter::new(file),
                lines: 0,
            }),
        })
    }

    /// Transcript file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line
    pub fn log(&self, category: LogCategory, text: &str) -> io::Result<()> {
        let line = format_entry(Local::now(), category, text);
        let mut writer = self.writer.lock();
        writeln!(writer.file, "{}", line)?;
        writer.lines += 1;

        // Flush periodically
        if writer.lines % FLUSH_EVERY == 0 {
            writer.file.flush()?;
        }
        Ok(())
    }

    /// Lines written so far
    pub fn lines_logged(&self) -> usize {
        self.writer.lock().lines
    }

    /// Flush to disk
    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().file.flush()
    }
}

impl Drop for TranscriptLogger {
    fn drop(&mut self) {
        let _ = self.writer.get_mut().file.flush();
    }
}

impl NotificationSink for TranscriptLogger {
    fn on_log(&self, text: &str, category: LogCategory) {
        if let Err(e) = self.log(category, text) {
            tracing::warn!(path = %self.path.display(), error = %e, "transcript write failed");
        }
    }

    fn on_state_change(&self, state: SessionState) {
        // Lifecycle lines are already logged; only flush at the boundaries
        if !state.is_data_mode() {
            if let Err(e) = self.flush() {
                tracing::warn!(path = %self.path.display(), error = %e, "transcript flush failed");
            }
        }
    }

    fn on_transfer_outcome(&self, _direction: TransferDirection, _outcome: &TransferOutcome) {}
}
