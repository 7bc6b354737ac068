//! XMODEM protocol implementation
//!
//! Original checksum variant: every block is framed as
//! `SOH seq !seq payload[128] checksum`, acknowledged with ACK or refused
//! with NAK, and the transfer ends with an acknowledged EOT.
//!
//! The engine talks to a [`ByteChannel`] directly and owns it for the whole
//! transfer. Plain XMODEM carries no file length, so a received file keeps
//! the padding of its last block.

use super::{TransferDirection, TransferError, TransferProgress, TransferState, TransferSummary};
use crate::core::transport::ByteChannel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

// XMODEM constants
/// Start of Header (128 byte block)
pub const SOH: u8 = 0x01;
/// End of Transmission
pub const EOT: u8 = 0x04;
/// Acknowledge
pub const ACK: u8 = 0x06;
/// Negative Acknowledge
pub const NAK: u8 = 0x15;
/// Cancel
pub const CAN: u8 = 0x18;

/// Payload bytes per block
pub const BLOCK_SIZE: usize = 128;
/// Bytes per framed block: header, sequence, complement, payload, checksum
pub const FRAME_LEN: usize = BLOCK_SIZE + 4;

const CANCEL_SEQUENCE: [u8; 3] = [CAN, CAN, CAN];

const PURGE_CHUNK: usize = 256;

/// Retry and timeout policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XmodemConfig {
    /// Retransmissions (sender) or refusals (receiver) per block before giving up
    pub retry_limit: u32,
    /// Wait for an ACK/NAK or for the next block once the transfer runs
    pub block_timeout_ms: u64,
    /// Total wait for the other side to start
    pub start_timeout_ms: u64,
    /// Receiver: interval between NAKs while waiting for the first block
    pub start_nak_interval_ms: u64,
    /// Receiver: silence required on the line before a NAK goes out
    pub purge_quiet_ms: u64,
    /// Fill byte for the last block
    pub pad_byte: u8,
}

impl Default for XmodemConfig {
    fn default() -> Self {
        Self {
            retry_limit: 10,
            block_timeout_ms: 10_000,
            start_timeout_ms: 60_000,
            start_nak_interval_ms: 3_000,
            purge_quiet_ms: 1_000,
            pad_byte: 0x00,
        }
    }
}

impl XmodemConfig {
    /// Steady-state timeout
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Start-of-transfer budget
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// NAK repeat interval before the first block
    pub fn start_nak_interval(&self) -> Duration {
        Duration::from_millis(self.start_nak_interval_ms)
    }

    /// Quiet period that ends a line purge
    pub fn purge_quiet(&self) -> Duration {
        Duration::from_millis(self.purge_quiet_ms)
    }
}

/// Sum of all bytes modulo 256
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Why a received frame was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// Fewer than [`FRAME_LEN`] bytes
    #[error("short block: {0} bytes")]
    Truncated(usize),

    /// First byte is not SOH
    #[error("bad header byte {0:#04x}")]
    BadHeader(u8),

    /// Sequence and complement disagree
    #[error("sequence {seq} does not match complement {complement}")]
    Sequence {
        /// Sequence byte
        seq: u8,
        /// Complement byte
        complement: u8,
    },

    /// Payload checksum mismatch
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum {
        /// Checksum computed over the payload
        expected: u8,
        /// Checksum byte on the wire
        actual: u8,
    },
}

/// One XMODEM block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    seq: u8,
    payload: [u8; BLOCK_SIZE],
}

impl Block {
    /// Create a block from a full payload
    pub fn new(seq: u8, payload: [u8; BLOCK_SIZE]) -> Self {
        Self { seq, payload }
    }

    /// Create a block from up to [`BLOCK_SIZE`] bytes, padding the rest
    pub fn from_chunk(seq: u8, chunk: &[u8], pad: u8) -> Self {
        let mut payload = [pad; BLOCK_SIZE];
        let n = chunk.len().min(BLOCK_SIZE);
        payload[..n].copy_from_slice(&chunk[..n]);
        Self { seq, payload }
    }

    /// Sequence number
    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Payload, padding included
    pub fn payload(&self) -> &[u8; BLOCK_SIZE] {
        &self.payload
    }

    /// Payload checksum
    pub fn checksum(&self) -> u8 {
        checksum(&self.payload)
    }

    /// Frame for the wire
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = SOH;
        frame[1] = self.seq;
        frame[2] = 255 - self.seq;
        frame[3..3 + BLOCK_SIZE].copy_from_slice(&self.payload);
        frame[FRAME_LEN - 1] = self.checksum();
        frame
    }

    /// Parse and verify a frame, header byte included
    pub fn decode(frame: &[u8]) -> Result<Self, BlockError> {
        if frame.len() < FRAME_LEN {
            return Err(BlockError::Truncated(frame.len()));
        }
        if frame[0] != SOH {
            return Err(BlockError::BadHeader(frame[0]));
        }

        let (seq, complement) = (frame[1], frame[2]);
        if seq != 255 - complement {
            return Err(BlockError::Sequence { seq, complement });
        }

        let mut payload = [0u8; BLOCK_SIZE];
        payload.copy_from_slice(&frame[3..3 + BLOCK_SIZE]);
        let expected = checksum(&payload);
        let actual = frame[FRAME_LEN - 1];
        if expected != actual {
            return Err(BlockError::Checksum { expected, actual });
        }

        Ok(Self { seq, payload })
    }
}

type ProgressFn = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// XMODEM sender/receiver
#[derive(Clone)]
pub struct XmodemEngine {
    config: XmodemConfig,
    file_name: String,
    progress: Option<ProgressFn>,
}

impl std::fmt::Debug for XmodemEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmodemEngine")
            .field("config", &self.config)
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

impl Default for XmodemEngine {
    fn default() -> Self {
        Self::new(XmodemConfig::default())
    }
}

impl XmodemEngine {
    /// Create an engine with the given policy
    pub fn new(config: XmodemConfig) -> Self {
        Self {
            config,
            file_name: String::new(),
            progress: None,
        }
    }

    /// Name reported in progress updates
    #[must_use]
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    /// Call `f` after every acknowledged block and on state changes
    #[must_use]
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&TransferProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(f));
        self
    }

    /// Retry and timeout policy
    pub fn config(&self) -> &XmodemConfig {
        &self.config
    }

    /// Bytes sent to abort a transfer
    pub fn cancel_sequence() -> &'static [u8] {
        &CANCEL_SEQUENCE
    }

    /// Send `source` to a receiver on `channel`.
    ///
    /// The source is read lazily, one block at a time, and never rewound.
    /// An empty source still goes out as one padded block.
    pub async fn send<C, R>(&self, channel: &C, source: &mut R) -> Result<TransferSummary, TransferError>
    where
        C: ByteChannel + ?Sized,
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut progress = TransferProgress::new(TransferDirection::Send, &self.file_name);
        self.report(&progress);

        let deadline = Instant::now() + self.config.start_timeout();
        match read_control(channel, deadline, &[NAK, CAN]).await? {
            Some(NAK) => debug!("receiver ready"),
            Some(_) => return Err(TransferError::Cancelled),
            None => return Err(TransferError::Timeout),
        }
        // Repeated start NAKs must not be taken as replies to block 1
        self.discard_input(channel).await?;
        progress.state = TransferState::InProgress;

        let mut summary = TransferSummary::default();
        let mut seq: u8 = 1;
        let mut chunk = [0u8; BLOCK_SIZE];

        loop {
            let n = match fill_chunk(source, &mut chunk).await {
                Ok(n) => n,
                Err(e) => {
                    self.abort(channel).await;
                    return Err(e.into());
                }
            };
            if n == 0 && summary.blocks > 0 {
                break;
            }

            let block = Block::from_chunk(seq, &chunk[..n], self.config.pad_byte);
            summary.retries += self.send_block(channel, &block).await?;
            summary.blocks += 1;
            summary.bytes += n as u64;

            progress.block_number = summary.blocks;
            progress.bytes_transferred = summary.bytes;
            progress.retry_count = summary.retries;
            self.report(&progress);

            seq = seq.wrapping_add(1);
            if n < BLOCK_SIZE {
                break;
            }
        }

        summary.retries += self.send_eot(channel).await?;

        progress.state = TransferState::Complete;
        progress.retry_count = summary.retries;
        self.report(&progress);
        info!(blocks = summary.blocks, bytes = summary.bytes, retries = summary.retries, "XMODEM send complete");
        Ok(summary)
    }

    /// Receive a file from a sender on `channel` into `sink`.
    ///
    /// Every accepted block is written whole, padding included. The sink is
    /// flushed before the final EOT is acknowledged.
    pub async fn receive<C, W>(&self, channel: &C, sink: &mut W) -> Result<TransferSummary, TransferError>
    where
        C: ByteChannel + ?Sized,
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut progress = TransferProgress::new(TransferDirection::Receive, &self.file_name);
        self.report(&progress);

        let start_deadline = Instant::now() + self.config.start_timeout();
        let mut summary = TransferSummary::default();
        let mut expected: u8 = 1;
        let mut started = false;
        let mut retries = 0u32;

        channel.write(&[NAK]).await?;

        loop {
            let deadline = if started {
                Instant::now() + self.config.block_timeout()
            } else {
                (Instant::now() + self.config.start_nak_interval()).min(start_deadline)
            };

            let Some(header) = read_control(channel, deadline, &[SOH, EOT, CAN]).await? else {
                if !started {
                    if Instant::now() >= start_deadline {
                        return Err(TransferError::Timeout);
                    }
                    debug!("no sender yet, repeating NAK");
                    channel.write(&[NAK]).await?;
                    continue;
                }

                retries += 1;
                summary.retries += 1;
                if retries > self.config.retry_limit {
                    self.abort(channel).await;
                    return Err(TransferError::Timeout);
                }
                warn!(block = expected, retries, "timeout waiting for block");
                self.purge_line(channel).await?;
                channel.write(&[NAK]).await?;
                continue;
            };

            match header {
                CAN => return Err(TransferError::Cancelled),
                EOT => {
                    sink.flush().await?;
                    channel.write(&[ACK]).await?;

                    progress.state = TransferState::Complete;
                    progress.retry_count = summary.retries;
                    self.report(&progress);
                    info!(blocks = summary.blocks, bytes = summary.bytes, retries = summary.retries, "XMODEM receive complete");
                    return Ok(summary);
                }
                _ => {}
            }

            started = true;
            progress.state = TransferState::InProgress;

            let body = read_exact(channel, FRAME_LEN - 1, Instant::now() + self.config.block_timeout()).await?;
            let decoded = match body {
                Some(body) => {
                    let mut frame = Vec::with_capacity(FRAME_LEN);
                    frame.push(SOH);
                    frame.extend_from_slice(&body);
                    Block::decode(&frame).map_err(|e| e.to_string())
                }
                None => Err("block timed out before it was complete".to_string()),
            };

            match decoded {
                Ok(block) if block.seq() == expected => {
                    if let Err(e) = sink.write_all(block.payload()).await {
                        self.abort(channel).await;
                        return Err(e.into());
                    }
                    channel.write(&[ACK]).await?;
                    trace!(seq = block.seq(), "block accepted");

                    expected = expected.wrapping_add(1);
                    retries = 0;
                    summary.blocks += 1;
                    summary.bytes += BLOCK_SIZE as u64;

                    progress.block_number = summary.blocks;
                    progress.bytes_transferred = summary.bytes;
                    progress.retry_count = summary.retries;
                    self.report(&progress);
                }
                Ok(block) if summary.blocks > 0 && block.seq() == expected.wrapping_sub(1) => {
                    debug!(seq = block.seq(), "duplicate block, acknowledging again");
                    channel.write(&[ACK]).await?;
                }
                Ok(block) => {
                    let reason = format!("expected block {expected}, got {}", block.seq());
                    self.refuse(channel, &mut retries, &mut summary, expected, &reason).await?;
                }
                Err(reason) => {
                    self.refuse(channel, &mut retries, &mut summary, expected, &reason).await?;
                }
            }
        }
    }

    async fn send_block<C>(&self, channel: &C, block: &Block) -> Result<u32, TransferError>
    where
        C: ByteChannel + ?Sized,
    {
        let frame = block.encode();
        let mut retries = 0u32;
        let mut naks = 0u32;

        loop {
            self.discard_input(channel).await?;
            channel.write(&frame).await?;

            let deadline = Instant::now() + self.config.block_timeout();
            match read_control(channel, deadline, &[ACK, NAK, CAN]).await? {
                Some(ACK) => {
                    trace!(seq = block.seq(), "block acknowledged");
                    return Ok(retries);
                }
                Some(NAK) => naks += 1,
                Some(_) => return Err(TransferError::Cancelled),
                None => {}
            }

            retries += 1;
            if retries > self.config.retry_limit {
                self.abort(channel).await;
                return Err(if naks == 0 {
                    TransferError::Timeout
                } else {
                    TransferError::RetriesExhausted {
                        block: block.seq(),
                        retries: self.config.retry_limit,
                    }
                });
            }
            warn!(seq = block.seq(), retries, "retransmitting block");
        }
    }

    async fn send_eot<C>(&self, channel: &C) -> Result<u32, TransferError>
    where
        C: ByteChannel + ?Sized,
    {
        let mut retries = 0u32;
        let mut naks = 0u32;

        loop {
            self.discard_input(channel).await?;
            channel.write(&[EOT]).await?;

            let deadline = Instant::now() + self.config.block_timeout();
            match read_control(channel, deadline, &[ACK, NAK, CAN]).await? {
                Some(ACK) => return Ok(retries),
                Some(NAK) => naks += 1,
                Some(_) => return Err(TransferError::Cancelled),
                None => {}
            }

            retries += 1;
            if retries > self.config.retry_limit {
                return Err(if naks == 0 {
                    TransferError::Timeout
                } else {
                    TransferError::RetriesExhausted {
                        block: 0,
                        retries: self.config.retry_limit,
                    }
                });
            }
            warn!(retries, "repeating EOT");
        }
    }

    async fn refuse<C>(
        &self,
        channel: &C,
        retries: &mut u32,
        summary: &mut TransferSummary,
        block: u8,
        reason: &str,
    ) -> Result<(), TransferError>
    where
        C: ByteChannel + ?Sized,
    {
        *retries += 1;
        summary.retries += 1;
        if *retries > self.config.retry_limit {
            self.abort(channel).await;
            return Err(TransferError::RetriesExhausted {
                block,
                retries: self.config.retry_limit,
            });
        }
        warn!(block, retries = *retries, reason, "refusing block");
        self.purge_line(channel).await?;
        channel.write(&[NAK]).await?;
        Ok(())
    }

    /// Receiver: drop the rest of a bad frame and wait for silence
    async fn purge_line<C>(&self, channel: &C) -> Result<(), TransferError>
    where
        C: ByteChannel + ?Sized,
    {
        let deadline = Instant::now() + self.config.block_timeout();
        match purge(channel, self.config.purge_quiet(), deadline).await {
            Ok(0) => Ok(()),
            Ok(dropped) => {
                debug!(dropped, "purged line");
                Ok(())
            }
            Err(e) => {
                self.abort(channel).await;
                Err(e)
            }
        }
    }

    /// Sender: drop replies that are already buffered, without waiting
    async fn discard_input<C>(&self, channel: &C) -> Result<(), TransferError>
    where
        C: ByteChannel + ?Sized,
    {
        let deadline = Instant::now() + self.config.block_timeout();
        let dropped = purge(channel, Duration::ZERO, deadline).await?;
        if dropped > 0 {
            debug!(dropped, "discarded stale input");
        }
        Ok(())
    }

    async fn abort<C>(&self, channel: &C)
    where
        C: ByteChannel + ?Sized,
    {
        if let Err(e) = channel.write(&CANCEL_SEQUENCE).await {
            debug!(error = %e, "could not send cancel sequence");
        }
    }

    fn report(&self, progress: &TransferProgress) {
        if let Some(ref f) = self.progress {
            f(progress);
        }
    }
}

/// Wait until one of `accept` arrives, skipping anything else
async fn read_control<C>(channel: &C, deadline: Instant, accept: &[u8]) -> Result<Option<u8>, TransferError>
where
    C: ByteChannel + ?Sized,
{
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        let data = channel.read(1, deadline - now).await?;
        if let Some(&byte) = data.first() {
            if accept.contains(&byte) {
                return Ok(Some(byte));
            }
            trace!(byte, "ignoring unexpected byte");
        }
    }
}

/// Read and drop input until nothing arrives for `quiet`.
///
/// Fails with [`TransferError::Protocol`] if the line is still busy at
/// `deadline`.
async fn purge<C>(channel: &C, quiet: Duration, deadline: Instant) -> Result<usize, TransferError>
where
    C: ByteChannel + ?Sized,
{
    let mut dropped = 0;
    loop {
        let data = channel.read(PURGE_CHUNK, quiet).await?;
        if data.is_empty() {
            return Ok(dropped);
        }
        dropped += data.len();
        if Instant::now() >= deadline {
            return Err(TransferError::Protocol(format!(
                "line still busy after discarding {dropped} bytes"
            )));
        }
    }
}

/// Read exactly `len` bytes, or `None` if the deadline passes first
async fn read_exact<C>(channel: &C, len: usize, deadline: Instant) -> Result<Option<Vec<u8>>, TransferError>
where
    C: ByteChannel + ?Sized,
{
    let mut buf = Vec::with_capacity(len);
    while buf.len() < len {
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        let data = channel.read(len - buf.len(), deadline - now).await?;
        buf.extend_from_slice(&data);
    }
    Ok(Some(buf))
}

/// Fill `buf` from `source` until full or end of input
async fn fill_chunk<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
