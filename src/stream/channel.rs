//! Type-erased raw socket

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Trait object for raw sockets (type-erased AsyncRead + AsyncWrite)
trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

type Slot = Mutex<Option<Box<dyn RawStream>>>;

/// A socket the transport negotiated on, whatever its concrete type
///
/// Listener and dialer both produce a `Channel`, so the rest of the
/// pipeline is not generic over TCP versus Unix domain sockets.
///
/// The socket can be closed from outside through a [`ChannelCloser`]. After
/// that, reads return EOF and writes fail with `BrokenPipe`.
pub struct Channel {
    inner: Arc<Slot>,
}

impl Channel {
    /// Wrap any `AsyncRead + AsyncWrite` socket
    ///
    /// ```ignore
    /// let tcp = TcpStream::connect("127.0.0.1:10001").await?;
    /// let channel = Channel::new(tcp);
    /// ```
    pub fn new<S>(inner: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(inner)))),
        }
    }

    /// Handle that closes this socket without going through the stream
    pub fn closer(&self) -> ChannelCloser {
        ChannelCloser {
            slot: Arc::downgrade(&self.inner),
        }
    }

    /// Whether the socket was released by a [`ChannelCloser`]
    pub fn is_closed(&self) -> bool {
        self.slot().is_none()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Box<dyn RawStream>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.slot().as_mut() {
            Some(raw) => Pin::new(raw.as_mut()).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.slot().as_mut() {
            Some(raw) => Pin::new(raw.as_mut()).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.slot().as_mut() {
            Some(raw) => Pin::new(raw.as_mut()).poll_flush(cx),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.slot().as_mut() {
            Some(raw) => Pin::new(raw.as_mut()).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Out-of-band close handle for a [`Channel`]
///
/// Holds no strong reference, so a dropped channel is not kept alive.
#[derive(Clone)]
pub struct ChannelCloser {
    slot: Weak<Slot>,
}

impl ChannelCloser {
    /// Drop the underlying socket, closing its file descriptor
    ///
    /// Returns `false` if the channel is gone or was already closed.
    pub fn close(&self) -> bool {
        let Some(slot) = self.slot.upgrade() else {
            return false;
        };
        let raw = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        raw.is_some()
    }

    /// Whether the channel still exists
    pub fn is_live(&self) -> bool {
        self.slot.strong_count() > 0
    }
}

impl fmt::Debug for ChannelCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCloser")
            .field("live", &self.is_live())
            .finish()
    }
}
