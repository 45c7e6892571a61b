//! Bounded byte pipes wiring one block's output to the next block's input.
//!
//! A [`PipeConnector`] owns an in-memory buffer of fixed capacity. The upstream block writes
//! through a [`PipeWriter`] and is suspended while the buffer is full, the downstream block
//! reads through a [`PipeReader`] and is suspended while it is empty. Bytes are delivered in
//! write order.
//!
//! A writer dropped without being shut down does not end the stream on its own: the end of
//! stream is held by an [`EndOfStreamGuard`] until the guard is dropped, so the owner of the
//! guard can poison the pipe first when the writing block failed.
//!
//! Every connector of a block set shares one poison token. Cancelling it wakes every reader and
//! writer suspended on any pipe with [`PipeError::Cancelled`] and makes further calls fail the
//! same way, discarding whatever is still buffered.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use metrics::counter;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use crate::metrics::{BLOCKSET_PIPE_BYTES_TOTAL, UPSTREAM_BLOCK_LABEL};

/// Reasons a pipe operation fails without the underlying buffer being at fault.
///
/// Carried inside the [`io::Error`]s returned by [`PipeReader`] and [`PipeWriter`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
    /// The block set poisoned its pipes, buffered data was discarded.
    #[error("pipe was cancelled")]
    Cancelled,
    /// The reading end was dropped, nothing will consume further writes.
    #[error("pipe reader was closed")]
    Closed,
}

impl PipeError {
    fn into_io(self) -> io::Error {
        let kind = match self {
            PipeError::Cancelled => io::ErrorKind::ConnectionAborted,
            PipeError::Closed => io::ErrorKind::BrokenPipe,
        };

        io::Error::new(kind, self)
    }
}

/// Bytes written through one pipe.
#[derive(Debug, Clone, Default)]
pub struct PipeStats {
    bytes: Arc<AtomicU64>,
}

impl PipeStats {
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn record(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Writing half of a pipe whose [`PipeWriter`] was dropped without a shutdown.
#[derive(Debug, Clone, Default)]
struct ParkedWriter(Arc<Mutex<Option<DuplexStream>>>);

impl ParkedWriter {
    fn park(&self, stream: DuplexStream) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
    }

    fn release(&self) {
        let stream = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(stream);
    }
}

/// Holds back the end of stream of a dropped [`PipeWriter`] until the guard is dropped.
///
/// The reader of a pipe whose writer was dropped without a shutdown keeps waiting for data
/// while the guard is alive.
#[derive(Debug)]
pub struct EndOfStreamGuard(ParkedWriter);

impl Drop for EndOfStreamGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Bounded buffer between two adjacent blocks.
#[derive(Debug)]
pub struct PipeConnector {
    upstream: String,
    downstream: String,
    writer: Option<PipeWriter>,
    reader: Option<PipeReader>,
    end_of_stream: Option<EndOfStreamGuard>,
    stats: PipeStats,
}

impl PipeConnector {
    /// Creates a pipe of `capacity` bytes from `upstream` to `downstream`.
    ///
    /// The pipe is poisoned when `poison` is cancelled.
    pub fn new(
        upstream: impl Into<String>,
        downstream: impl Into<String>,
        capacity: usize,
        poison: &CancellationToken,
    ) -> Self {
        let (write_half, read_half) = tokio::io::duplex(capacity);
        let stats = PipeStats::default();
        let parked = ParkedWriter::default();

        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
            writer: Some(PipeWriter {
                inner: Some(write_half),
                poison: Poison::new(poison.clone()),
                stats: stats.clone(),
                parked: parked.clone(),
            }),
            reader: Some(PipeReader {
                inner: read_half,
                poison: Poison::new(poison.clone()),
            }),
            end_of_stream: Some(EndOfStreamGuard(parked)),
            stats,
        }
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn downstream(&self) -> &str {
        &self.downstream
    }

    /// Hands out the writing end, to be given to the upstream block.
    pub fn take_writer(&mut self) -> Option<PipeWriter> {
        self.writer.take()
    }

    /// Hands out the reading end, to be given to the downstream block.
    pub fn take_reader(&mut self) -> Option<PipeReader> {
        self.reader.take()
    }

    /// Hands out the guard holding back the end of stream of a dropped writer.
    ///
    /// Until taken, the guard lives as long as the connector.
    pub fn take_end_of_stream_guard(&mut self) -> Option<EndOfStreamGuard> {
        self.end_of_stream.take()
    }

    pub fn stats(&self) -> PipeStats {
        self.stats.clone()
    }

    /// Logs and records how many bytes went through the pipe.
    pub fn report(&self) {
        let bytes = self.stats.bytes_transferred();

        debug!(
            upstream = %self.upstream,
            downstream = %self.downstream,
            bytes,
            "pipe torn down"
        );

        counter!(
            BLOCKSET_PIPE_BYTES_TOTAL,
            UPSTREAM_BLOCK_LABEL => self.upstream.clone()
        )
        .increment(bytes);
    }
}

/// Poison state of one pipe end.
struct Poison {
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl Poison {
    fn new(token: CancellationToken) -> Self {
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self { token, cancelled }
    }

    /// Returns `true` once the token is cancelled, registering the task for wake-up otherwise.
    fn poll_poisoned(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready()
    }
}

impl std::fmt::Debug for Poison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poison")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Writing end of a [`PipeConnector`].
///
/// Shutting the writer down signals end of stream to the reader. Dropping it does too, once
/// the connector's [`EndOfStreamGuard`] is dropped.
#[derive(Debug)]
pub struct PipeWriter {
    inner: Option<DuplexStream>,
    poison: Poison,
    stats: PipeStats,
    parked: ParkedWriter,
}

impl PipeWriter {
    fn inner(&mut self) -> io::Result<Pin<&mut DuplexStream>> {
        self.inner
            .as_mut()
            .map(Pin::new)
            .ok_or_else(|| PipeError::Closed.into_io())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            self.parked.park(inner);
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poison.poll_poisoned(cx) {
            return Poll::Ready(Err(PipeError::Cancelled.into_io()));
        }

        let inner = match this.inner() {
            Ok(inner) => inner,
            Err(err) => return Poll::Ready(Err(err)),
        };

        match inner.poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                this.stats.record(written);
                Poll::Ready(Ok(written))
            }
            Poll::Ready(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => {
                Poll::Ready(Err(PipeError::Closed.into_io()))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poison.poll_poisoned(cx) {
            return Poll::Ready(Err(PipeError::Cancelled.into_io()));
        }

        match this.inner() {
            Ok(inner) => inner.poll_flush(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poison.poll_poisoned(cx) {
            return Poll::Ready(Err(PipeError::Cancelled.into_io()));
        }

        match this.inner() {
            Ok(inner) => inner.poll_shutdown(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

/// Reading end of a [`PipeConnector`].
///
/// Reads return `0` bytes once the writer shut down and the buffer is drained.
#[derive(Debug)]
pub struct PipeReader {
    inner: DuplexStream,
    poison: Poison,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poison.poll_poisoned(cx) {
            return Poll::Ready(Err(PipeError::Cancelled.into_io()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    use super::*;

    fn connector(capacity: usize, poison: &CancellationToken) -> (PipeWriter, PipeReader) {
        let mut connector = PipeConnector::new("up", "down", capacity, poison);
        (
            connector.take_writer().unwrap(),
            connector.take_reader().unwrap(),
        )
    }

    #[tokio::test]
    async fn bytes_arrive_in_write_order() {
        let poison = CancellationToken::new();
        let (mut writer, mut reader) = connector(4, &poison);

        let producer = tokio::spawn(async move {
            for chunk in [&b"hello "[..], b"block ", b"set"] {
                writer.write_all(chunk).await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        producer.await.unwrap();

        assert_eq!(received, b"hello block set");
    }

    #[tokio::test]
    async fn full_buffer_suspends_writer() {
        let poison = CancellationToken::new();
        let (mut writer, _reader) = connector(8, &poison);

        writer.write_all(&[0; 8]).await.unwrap();

        let blocked = timeout(Duration::from_millis(50), writer.write_all(&[0; 1])).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn poison_wakes_suspended_writer() {
        let poison = CancellationToken::new();
        let (mut writer, _reader) = connector(8, &poison);
        writer.write_all(&[0; 8]).await.unwrap();

        let blocked = tokio::spawn(async move { writer.write_all(&[1; 8]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        poison.cancel();

        let err = timeout(Duration::from_secs(1), blocked)
            .await
            .expect("writer was not woken")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn poison_wakes_suspended_reader_and_discards_buffer() {
        let poison = CancellationToken::new();
        let (mut writer, mut reader) = connector(16, &poison);
        writer.write_all(b"stale").await.unwrap();
        poison.cancel();

        let mut buf = [0; 16];
        let err = reader.read(&mut buf).await.unwrap_err();
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<PipeError>());
        assert_eq!(inner, Some(&PipeError::Cancelled));
    }

    #[tokio::test]
    async fn dropped_reader_closes_pipe_for_writer() {
        let poison = CancellationToken::new();
        let (mut writer, reader) = connector(16, &poison);
        drop(reader);

        let err = writer.write_all(b"lost").await.unwrap_err();
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<PipeError>());
        assert_eq!(inner, Some(&PipeError::Closed));
    }

    #[tokio::test]
    async fn dropped_writer_ends_stream_once_guard_is_released() {
        let poison = CancellationToken::new();
        let mut connector = PipeConnector::new("up", "down", 16, &poison);
        let guard = connector.take_end_of_stream_guard().unwrap();
        let mut writer = connector.take_writer().unwrap();
        let mut reader = connector.take_reader().unwrap();

        writer.write_all(b"partial").await.unwrap();
        drop(writer);

        let mut received = [0; 7];
        reader.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"partial");

        let mut buf = [0; 16];
        let pending = timeout(Duration::from_millis(50), reader.read(&mut buf)).await;
        assert!(pending.is_err());

        drop(guard);

        let read = timeout(Duration::from_secs(1), reader.read(&mut buf))
            .await
            .expect("end of stream was not delivered")
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn poison_before_release_hides_truncated_stream() {
        let poison = CancellationToken::new();
        let mut connector = PipeConnector::new("up", "down", 16, &poison);
        let guard = connector.take_end_of_stream_guard().unwrap();
        let mut writer = connector.take_writer().unwrap();
        let mut reader = connector.take_reader().unwrap();

        writer.write_all(b"trunc").await.unwrap();
        drop(writer);
        poison.cancel();
        drop(guard);

        let mut received = Vec::new();
        let err = reader.read_to_end(&mut received).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn stats_count_written_bytes() {
        let poison = CancellationToken::new();
        let mut connector = PipeConnector::new("up", "down", 64, &poison);
        let stats = connector.stats();
        let mut writer = connector.take_writer().unwrap();

        writer.write_all(b"0123456789").await.unwrap();

        assert_eq!(stats.bytes_transferred(), 10);
        assert!(connector.take_writer().is_none());
    }
}
