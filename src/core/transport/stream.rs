//! `ByteChannel` over any tokio byte stream

use super::{ByteChannel, ChannelError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

/// Read-ahead size for a single stream read
const READ_AHEAD: usize = 1024;

/// Channel over a split `AsyncRead + AsyncWrite` stream.
///
/// Read and write halves are locked independently, so a blocked read never
/// holds up a write. Closing cancels a token that every pending operation
/// selects on, then drops the stream.
pub struct StreamChannel<S> {
    name: String,
    reader: tokio::sync::Mutex<Option<ReadHalf<S>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<S>>>,
    pending: Mutex<BytesMut>,
    closed: CancellationToken,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a stream
    pub fn new(name: impl Into<String>, stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            name: name.into(),
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: Mutex::new(BytesMut::with_capacity(READ_AHEAD)),
            closed: CancellationToken::new(),
        }
    }

    fn take_pending(&self, max: usize) -> Option<Bytes> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return None;
        }
        let n = max.min(pending.len());
        Some(pending.split_to(n).freeze())
    }
}

impl StreamChannel<DuplexStream> {
    /// Two channels connected back to back in memory.
    ///
    /// Whatever one side writes, the other reads. `capacity` bounds the
    /// bytes in flight per direction.
    pub fn loopback(name_a: &str, name_b: &str, capacity: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(capacity);
        (Self::new(name_a, a), Self::new(name_b, b))
    }
}

fn map_io(err: std::io::Error) -> ChannelError {
    match err.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof => {
            ChannelError::Closed
        }
        _ => ChannelError::Io(err),
    }
}

#[async_trait]
impl<S> ByteChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, max: usize, timeout: Duration) -> Result<Bytes, ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        if max == 0 {
            return Ok(Bytes::new());
        }

        let mut guard = tokio::select! {
            () = self.closed.cancelled() => return Err(ChannelError::Closed),
            guard = self.reader.lock() => guard,
        };

        if let Some(bytes) = self.take_pending(max) {
            return Ok(bytes);
        }

        let reader = guard.as_mut().ok_or(ChannelError::Closed)?;
        let mut buffer = vec![0u8; READ_AHEAD.max(max)];

        let result = tokio::select! {
            () = self.closed.cancelled() => return Err(ChannelError::Closed),
            result = tokio::time::timeout(timeout, reader.read(&mut buffer)) => result,
        };

        match result {
            Err(_elapsed) => Ok(Bytes::new()),
            Ok(Ok(0)) => Err(ChannelError::Closed),
            Ok(Ok(n)) => {
                let mut data = BytesMut::from(&buffer[..n]);
                if n > max {
                    let rest = data.split_off(max);
                    self.pending.lock().extend_from_slice(&rest);
                }
                Ok(data.freeze())
            }
            Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => Ok(Bytes::new()),
            Ok(Err(e)) => Err(map_io(e)),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<usize, ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }

        let mut guard = tokio::select! {
            () = self.closed.cancelled() => return Err(ChannelError::Closed),
            guard = self.writer.lock() => guard,
        };
        let writer = guard.as_mut().ok_or(ChannelError::Closed)?;

        let result = tokio::select! {
            () = self.closed.cancelled() => return Err(ChannelError::Closed),
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => result,
        };

        result.map(|()| data.len()).map_err(map_io)
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        // Pending operations release their locks once they see the token.
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
        self.pending.lock().clear();
        tracing::debug!(channel = %self.name, "channel closed");
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    fn bytes_available(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_loopback_roundtrip() {
        let (a, b) = StreamChannel::loopback("A", "B", 256);

        assert_eq!(a.write(b"ATZ\r\n").await.unwrap(), 5);
        let data = b.read(16, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&data[..], b"ATZ\r\n");
    }

    #[tokio::test]
    async fn test_read_timeout_returns_empty() {
        let (a, _b) = StreamChannel::loopback("A", "B", 256);
        let data = a.read(16, SHORT).await.unwrap();
        assert!(data.is_empty());
        assert!(a.is_open());
    }

    #[tokio::test]
    async fn test_read_respects_max_and_buffers_rest() {
        let (a, b) = StreamChannel::loopback("A", "B", 256);
        a.write(b"\x01\x02\x03\x04").await.unwrap();

        let first = b.read(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&first[..], &[0x01]);
        assert_eq!(b.bytes_available(), 3);

        let rest = b.read(8, SHORT).await.unwrap();
        assert_eq!(&rest[..], &[0x02, 0x03, 0x04]);
        assert_eq!(b.bytes_available(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_read() {
        let (a, _b) = StreamChannel::loopback("A", "B", 256);
        let a = std::sync::Arc::new(a);

        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.read(16, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(SHORT).await;
        a.close().await;

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));
        assert!(!a.is_open());
        assert!(matches!(a.write(b"x").await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_scripted_modem_exchange() {
        let modem = tokio_test::io::Builder::new()
            .write(b"ATZ\r\n")
            .read(b"OK\r\n")
            .build();
        let channel = StreamChannel::new("scripted", modem);

        assert_eq!(channel.write(b"ATZ\r\n").await.unwrap(), 5);
        let reply = channel.read(16, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&reply[..], b"OK\r\n");
        assert_eq!(channel.name(), "scripted");
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let (a, b) = StreamChannel::loopback("A", "B", 256);
        b.close().await;
        let result = a.read(16, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ChannelError::Closed)));
    }
}
