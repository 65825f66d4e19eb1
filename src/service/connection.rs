//! # Connection
//!
//! An authenticated, encrypted, bidirectional stream. Created only by a
//! successful handshake (or by the file-backed variant), shared as
//! `Arc<Connection>` between the task that drives it and the server's session
//! table.
//!
//! Plain reads and writes lock only their own half. [`Connection::blocked`]
//! takes a separate guard, so it serializes blocked sections against each other
//! but does not stop a concurrent plain read or write from interleaving.

use crate::core::validate::{MismatchHandler, STRICT};
use crate::core::wire::{FrameReader, FrameWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::identity::User;
use crate::protocol::magic::LOG_OUT;
use crate::transport::{BoxReader, BoxWriter};
use crate::utils::timeout::{with_timeout_error, DEFAULT_TIMEOUT};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Read/write timeout of a socket-backed connection; zero means none.
#[derive(Debug, Default)]
struct TimeoutControl {
    millis: AtomicU64,
}

impl TimeoutControl {
    fn get(&self) -> Option<Duration> {
        match self.millis.load(Ordering::Acquire) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn set(&self, timeout: Option<Duration>) {
        let ms = timeout.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1));
        self.millis.store(ms, Ordering::Release);
    }
}

/// Puts back the timeout a blocked section replaced, including when the
/// section's future is dropped before it finishes.
struct RestoreTimeout<'a> {
    control: &'a TimeoutControl,
    previous: Option<Duration>,
}

impl Drop for RestoreTimeout<'_> {
    fn drop(&mut self) {
        self.control.set(self.previous);
    }
}

/// Turns an unexpected [`LOG_OUT`] into [`ProtocolError::LoggedOut`] before
/// consulting the caller's handler.
struct LogOutAware<'a>(&'a dyn MismatchHandler);

impl MismatchHandler for LogOutAware<'_> {
    fn end_of_stream(&self, missing: usize) -> ProtocolError {
        self.0.end_of_stream(missing)
    }

    fn mismatch(&self, expected: i64, actual: i64) -> Result<i64> {
        if actual == i64::from(LOG_OUT) {
            return Err(ProtocolError::LoggedOut);
        }
        self.0.mismatch(expected, actual)
    }

    fn mismatch_any(&self, expected: &[i64], actual: i64) -> Result<i64> {
        if actual == i64::from(LOG_OUT) {
            return Err(ProtocolError::LoggedOut);
        }
        self.0.mismatch_any(expected, actual)
    }

    fn write_read_race(&self, written: i64, expected: i64, actual: i64) -> Result<i64> {
        if actual == i64::from(LOG_OUT) {
            return Err(ProtocolError::LoggedOut);
        }
        self.0.write_read_race(written, expected, actual)
    }
}

/// Authenticated encrypted connection.
pub struct Connection {
    reader: Mutex<Option<FrameReader<BoxReader>>>,
    writer: Mutex<Option<FrameWriter<BoxWriter>>>,
    user: Arc<User>,
    timeouts: Option<TimeoutControl>,
    modifications: u64,
    closed: AtomicBool,
    cancel: CancellationToken,
    block: Mutex<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("user", &self.user.name())
            .field("modifications", &self.modifications)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Connection over a socket; supports timeouts.
    pub(crate) fn socket(
        reader: FrameReader<BoxReader>,
        writer: FrameWriter<BoxWriter>,
        user: Arc<User>,
        modifications: u64,
    ) -> Self {
        Self::build(reader, writer, user, modifications, Some(TimeoutControl::default()))
    }

    /// Connection over a file; has no timeout capability.
    pub(crate) fn file(
        reader: FrameReader<BoxReader>,
        writer: FrameWriter<BoxWriter>,
        user: Arc<User>,
        modifications: u64,
    ) -> Self {
        Self::build(reader, writer, user, modifications, None)
    }

    fn build(
        reader: FrameReader<BoxReader>,
        writer: FrameWriter<BoxWriter>,
        user: Arc<User>,
        modifications: u64,
        timeouts: Option<TimeoutControl>,
    ) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            user,
            timeouts,
            modifications,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            block: Mutex::new(()),
        }
    }

    /// The authenticated user.
    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    /// The user's modification count when the connection was established.
    pub fn modification_count(&self) -> u64 {
        self.modifications
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The timeout currently applied to reads and writes.
    ///
    /// Writes are bounded as well as reads so that a peer which stops draining
    /// its socket cannot stall a log-out notice.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeouts.as_ref().and_then(TimeoutControl::get)
    }

    /// Apply `timeout` to subsequent reads and writes; `None` disables it.
    ///
    /// # Errors
    /// [`ProtocolError::Unsupported`] when the transport cannot time out.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let control = self
            .timeouts
            .as_ref()
            .ok_or(ProtocolError::Unsupported(constants::ERR_NO_TIMEOUT))?;
        control.set(timeout);
        Ok(())
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let limited = async {
            match self.timeout() {
                Some(limit) => with_timeout_error(fut, limit).await,
                None => fut.await,
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = limited => result,
        }
    }

    pub async fn read_int(&self) -> Result<i32> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.bounded(reader.read_int()).await
    }

    pub async fn read_long(&self) -> Result<i64> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.bounded(reader.read_long()).await
    }

    pub async fn read_byte(&self) -> Result<u8> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.bounded(reader.read_byte()).await
    }

    pub async fn read_string(&self) -> Result<String> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.bounded(reader.read_string()).await
    }

    /// Fill `buf` completely.
    pub async fn read_arr(&self, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.bounded(reader.read_arr(buf)).await
    }

    /// Read an int that must be one of `accepted`, failing strictly otherwise.
    pub async fn read_int_one_of(&self, accepted: &[i32]) -> Result<i32> {
        self.read_int_with(accepted, &STRICT).await
    }

    pub async fn read_int_either(&self, a: i32, b: i32) -> Result<i32> {
        self.read_int_with(&[a, b], &STRICT).await
    }

    pub async fn read_int_expect(&self, expected: i32) -> Result<i32> {
        self.read_int_with(&[expected], &STRICT).await
    }

    /// Read an int that must be one of `accepted`, letting `handler` reconcile a mismatch.
    pub async fn read_int_with(&self, accepted: &[i32], handler: &dyn MismatchHandler) -> Result<i32> {
        let aware = LogOutAware(handler);
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.bounded(reader.read_int_one_of(accepted, &aware)).await
    }

    /// Read a byte that must be one of `accepted`, letting `handler` reconcile a mismatch.
    pub async fn read_byte_with(&self, accepted: &[u8], handler: &dyn MismatchHandler) -> Result<u8> {
        let aware = LogOutAware(handler);
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.bounded(reader.read_byte_one_of(accepted, &aware)).await
    }

    pub async fn write_int(&self, value: i32) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.bounded(writer.write_int(value)).await
    }

    pub async fn write_long(&self, value: i64) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.bounded(writer.write_long(value)).await
    }

    /// Write one byte; values outside `0..=255` are rejected.
    pub async fn write_byte(&self, value: i32) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.bounded(writer.write_byte(value)).await
    }

    pub async fn write_string(&self, value: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.bounded(writer.write_string(value)).await
    }

    pub async fn write_arr(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.bounded(writer.write_arr(bytes)).await
    }

    /// Write `written`, then read the acknowledgement `ack`. Any other value is
    /// handed to `handler` as a write-then-read race.
    pub async fn exchange_int(
        &self,
        written: i32,
        ack: i32,
        handler: &dyn MismatchHandler,
    ) -> Result<i32> {
        self.write_int(written).await?;
        let actual = self.read_int().await?;
        if actual == ack {
            return Ok(actual);
        }
        let resolved = LogOutAware(handler).write_read_race(
            i64::from(written),
            i64::from(ack),
            i64::from(actual),
        )?;
        i32::try_from(resolved)
            .map_err(|_| ProtocolError::Corrupted(format!("reconciled value {resolved} is not an int")))
    }

    /// Run `exec` while holding this connection's block guard.
    pub async fn blocked<T, F, Fut>(self: &Arc<Self>, exec: F) -> Result<T>
    where
        F: FnOnce(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _block = self.block.lock().await;
        exec(Arc::clone(self)).await
    }

    /// Run `exec` under the block guard with `timeout` applied; if it fails with a
    /// timeout, run `on_timeout` instead of propagating. The previous timeout is
    /// restored afterwards, also when this future is dropped part-way.
    pub async fn blocked_with_timeout<T, F, Fut, G, GFut>(
        self: &Arc<Self>,
        timeout: Duration,
        exec: F,
        on_timeout: G,
    ) -> Result<T>
    where
        F: FnOnce(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce(Arc<Connection>) -> GFut,
        GFut: Future<Output = Result<T>>,
    {
        let control = self
            .timeouts
            .as_ref()
            .ok_or(ProtocolError::Unsupported(constants::ERR_NO_TIMEOUT))?;
        let _block = self.block.lock().await;
        let restore = RestoreTimeout {
            control,
            previous: control.get(),
        };
        control.set(Some(timeout));
        let result = exec(Arc::clone(self)).await;
        drop(restore);
        match result {
            Err(e) if e.is_timeout() => {
                debug!(user = %self.user.name(), "Blocked section timed out");
                on_timeout(Arc::clone(self)).await
            }
            other => other,
        }
    }

    /// Close both halves. Idempotent; the reader is released even when shutting
    /// down the writer fails, and the first failure is returned.
    #[instrument(skip(self), fields(user = %self.user.name()))]
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();

        let write_result = match self.writer.lock().await.take() {
            Some(mut writer) => with_timeout_error(writer.shutdown(), DEFAULT_TIMEOUT).await,
            None => Ok(()),
        };
        let reader = self.reader.lock().await.take();
        drop(reader);

        if let Err(e) = &write_result {
            warn!(error = %e, "Failed to shut down output stream");
        }
        debug!("Connection closed");
        write_result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::core::validate::RaceTolerant;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

    fn plain_pair() -> (Arc<Connection>, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(ours);
        let reader: BoxReader = Box::new(r);
        let writer: BoxWriter = Box::new(w);
        let conn = Connection::socket(
            FrameReader::new(reader),
            FrameWriter::new(writer),
            Arc::new(User::new("ann", "pw")),
            7,
        );
        (Arc::new(conn), theirs)
    }

    struct FailingShutdown;

    impl AsyncWrite for FailingShutdown {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("shutdown refused")))
        }
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let (conn, _peer) = plain_pair();
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        conn.close().await.unwrap();
        assert!(matches!(conn.read_int().await, Err(ProtocolError::ConnectionClosed)));
        assert!(matches!(conn.write_int(1).await, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_releases_reader_when_writer_fails() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let reader: BoxReader = Box::new(ours);
        let writer: BoxWriter = Box::new(FailingShutdown);
        let conn = Connection::socket(
            FrameReader::new(reader),
            FrameWriter::new(writer),
            Arc::new(User::new("ann", "pw")),
            0,
        );
        let err = conn.close().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
        // The input side was dropped, so the peer sees a closed pipe.
        let mut buf = [0u8; 1];
        assert_eq!(theirs.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_read() {
        let (conn, _peer) = plain_pair();
        let reading = Arc::clone(&conn);
        let task = tokio::spawn(async move { reading.read_int().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_timeout_applies_to_reads() {
        let (conn, _peer) = plain_pair();
        conn.set_timeout(Some(Duration::from_millis(20))).unwrap();
        assert!(conn.read_int().await.unwrap_err().is_timeout());
        conn.set_timeout(None).unwrap();
        assert_eq!(conn.timeout(), None);
    }

    #[tokio::test]
    async fn test_blocked_with_timeout_runs_fallback_and_restores() {
        let (conn, _peer) = plain_pair();
        let value = conn
            .blocked_with_timeout(
                Duration::from_millis(20),
                |c| async move { c.read_int().await },
                |_| async { Ok(-1) },
            )
            .await
            .unwrap();
        assert_eq!(value, -1);
        assert_eq!(conn.timeout(), None);
    }

    #[tokio::test]
    async fn test_cancelled_blocked_section_restores_timeout() {
        let (conn, _peer) = plain_pair();
        conn.set_timeout(Some(Duration::from_secs(5))).unwrap();

        let section = conn.blocked_with_timeout(
            Duration::from_secs(30),
            |c| async move { c.read_int().await },
            |_| async { Ok(0) },
        );
        assert!(tokio::time::timeout(Duration::from_millis(10), section)
            .await
            .is_err());

        assert_eq!(conn.timeout(), Some(Duration::from_secs(5)));
        // The block guard was released with the dropped section.
        let value = conn.blocked(|_| async { Ok(3) }).await.unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_huge_timeout_saturates() {
        let (conn, _peer) = plain_pair();
        conn.set_timeout(Some(Duration::MAX)).unwrap();
        assert_eq!(conn.timeout(), Some(Duration::from_millis(u64::MAX)));
        conn.set_timeout(Some(Duration::from_micros(10))).unwrap();
        assert_eq!(conn.timeout(), Some(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn test_read_byte_with_consults_handler() {
        let (conn, mut peer) = plain_pair();
        peer.write_all(&[7, 9]).await.unwrap();

        let handler = RaceTolerant::new().allow(1, 7);
        assert_eq!(conn.read_byte_with(&[1], &handler).await.unwrap(), 7);
        handler.settle();

        match conn.read_byte_with(&[1, 2], &STRICT).await {
            Err(ProtocolError::Mismatch { actual, expected }) => {
                assert_eq!(actual, 9);
                assert_eq!(expected, vec![1, 2]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_logout_marker_surfaces() {
        let (conn, mut peer) = plain_pair();
        peer.write_all(&LOG_OUT.to_le_bytes()).await.unwrap();
        assert!(matches!(conn.read_int_expect(5).await, Err(ProtocolError::LoggedOut)));
    }

    #[tokio::test]
    async fn test_exchange_int_absorbs_crossing_write() {
        let (conn, mut peer) = plain_pair();
        // The peer sends its own request (42) before acknowledging ours (1).
        peer.write_all(&42i32.to_le_bytes()).await.unwrap();
        let handler = RaceTolerant::new().allow(1, 42);
        assert_eq!(conn.exchange_int(9, 1, &handler).await.unwrap(), 42);
        assert!(handler.pending().is_some());

        let mut written = [0u8; 4];
        peer.read_exact(&mut written).await.unwrap();
        assert_eq!(i32::from_le_bytes(written), 9);

        peer.write_all(&1i32.to_le_bytes()).await.unwrap();
        assert_eq!(conn.read_int_expect(1).await.unwrap(), 1);
        handler.settle();
        assert!(handler.pending().is_none());
    }

    #[tokio::test]
    async fn test_reads_through_boxed_stream() {
        let (conn, mut peer) = plain_pair();
        peer.write_all(&5i32.to_le_bytes()).await.unwrap();
        peer.write_all(&[3, b'a', b'b', b'c']).await.unwrap();
        assert_eq!(conn.read_int().await.unwrap(), 5);
        let mut arr = [0u8; 4];
        conn.read_arr(&mut arr).await.unwrap();
        assert_eq!(&arr, &[3, b'a', b'b', b'c']);
        assert_eq!(conn.modification_count(), 7);
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_connection_is_shareable() {
        assert_send_sync::<Connection>();
    }
}
