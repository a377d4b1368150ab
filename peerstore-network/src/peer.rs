//! Peer abstraction
//!
//! A [`Peer`] is one live connection to a remote node. Protocol code sees
//! only identity, send and close, plus raw read and write handles used
//! for stream payloads.

use peerstore_core::error::{PeerStoreError, Result};
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, Take};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::debug;

/// Raw reader over a peer connection, held while a stream is consumed
pub type StreamReader<'a> = Box<dyn AsyncRead + Send + Unpin + 'a>;

/// Raw writer over a peer connection, held while a stream is pushed
pub type StreamWriter<'a> = Box<dyn AsyncWrite + Send + Unpin + 'a>;

/// A remote node connection
pub trait Peer: Send + Sync {
    /// Remote address, used as the peer's identity
    fn remote_addr(&self) -> &str;

    /// True when this side dialed the connection
    fn is_outbound(&self) -> bool;

    /// Write `data` to the connection
    fn send<'a>(&'a self, data: &'a [u8]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Borrow the read side to consume stream bytes directly.
    ///
    /// Only valid after the read loop has handed over a stream frame and
    /// before [`Peer::close_stream`] is called.
    fn open_stream(&self) -> Pin<Box<dyn Future<Output = StreamReader<'_>> + Send + '_>>;

    /// Hand the connection back to the read loop
    fn close_stream(&self);

    /// Borrow the write side exclusively to push a stream frame.
    /// Other sends to this peer wait until the writer is dropped.
    fn stream_writer(&self) -> Pin<Box<dyn Future<Output = StreamWriter<'_>> + Send + '_>>;

    /// Shut down the write side of the connection
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Peer over a TCP connection
pub struct TcpPeer {
    remote: String,
    outbound: bool,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    stream_done: Notify,
}

impl TcpPeer {
    /// Wrap an established connection
    pub fn new(conn: TcpStream, outbound: bool) -> Result<Self> {
        let remote = conn.peer_addr()?.to_string();
        conn.set_nodelay(true)?;
        let (reader, writer) = conn.into_split();
        Ok(Self {
            remote,
            outbound,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            stream_done: Notify::new(),
        })
    }

    /// Lock the read side for one frame decode
    pub(crate) async fn lock_reader(&self) -> MutexGuard<'_, OwnedReadHalf> {
        self.reader.lock().await
    }

    /// Park the read loop until the protocol layer calls `close_stream`
    pub(crate) async fn wait_stream_closed(&self) {
        self.stream_done.notified().await;
    }
}

impl Peer for TcpPeer {
    fn remote_addr(&self) -> &str {
        &self.remote
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    fn send<'a>(&'a self, data: &'a [u8]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut writer = self.writer.lock().await;
            writer.write_all(data).await?;
            Ok::<(), PeerStoreError>(())
        })
    }

    fn open_stream(&self) -> Pin<Box<dyn Future<Output = StreamReader<'_>> + Send + '_>> {
        Box::pin(async move {
            let guard = self.reader.lock().await;
            Box::new(GuardedReader(guard)) as StreamReader<'_>
        })
    }

    fn close_stream(&self) {
        debug!(peer = %self.remote, "Stream released");
        // A stored permit covers a release that lands before the loop parks.
        self.stream_done.notify_one();
    }

    fn stream_writer(&self) -> Pin<Box<dyn Future<Output = StreamWriter<'_>> + Send + '_>> {
        Box::pin(async move {
            let guard = self.writer.lock().await;
            Box::new(GuardedWriter(guard)) as StreamWriter<'_>
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await?;
            Ok::<(), PeerStoreError>(())
        })
    }
}

impl std::fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPeer")
            .field("remote", &self.remote)
            .field("outbound", &self.outbound)
            .finish_non_exhaustive()
    }
}

/// Reads exactly `len` bytes of a stream payload.
///
/// Stops at `len` like [`AsyncReadExt::take`], but an end of input before
/// `len` bytes is an `UnexpectedEof` error instead of a clean EOF.
#[derive(Debug)]
pub struct ExactReader<R> {
    inner: Take<R>,
}

impl<R: AsyncRead + Unpin> ExactReader<R> {
    pub fn new(inner: R, len: u64) -> Self {
        Self {
            inner: inner.take(len),
        }
    }

    /// Bytes still owed by the stream
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }

    /// Read and discard whatever is left of the payload
    pub async fn drain(&mut self) -> std::io::Result<u64> {
        tokio::io::copy(self, &mut tokio::io::sink()).await
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ExactReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let missing = this.inner.limit();
        if buf.filled().len() == before && buf.remaining() > 0 && missing > 0 {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream ended {} bytes short", missing),
            )));
        }
        Poll::Ready(Ok(()))
    }
}

struct GuardedReader<'a>(MutexGuard<'a, OwnedReadHalf>);

impl AsyncRead for GuardedReader<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut *this.0).poll_read(cx, buf)
    }
}

struct GuardedWriter<'a>(MutexGuard<'a, OwnedWriteHalf>);

impl AsyncWrite for GuardedWriter<'_> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().0).poll_shutdown(cx)
    }
}
