//! WebSocket byte stream
//!
//! [`WsStream`] sits between the raw socket and the connection's own protocol
//! stack. Writes become single final binary frames, masked when the local
//! role is the initiator; reads return the unmasked payload of data frames.
//! The connection above never sees WebSocket framing.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes, BytesMut};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::backpressure::Backpressure;
use crate::binder::Activation;
use crate::codec::{Decoded, FrameCodec, Role};
use crate::frame::FrameParser;
use crate::shutdown::Lifeline;
use crate::{Config, RECV_BUFFER_SIZE};

/// Close status sent when the local side shuts the stream down
const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Normal operation
    Open,
    /// Close frame queued by a local shutdown; reads continue
    CloseSent,
    /// Peer sent a close frame; no further reads or writes
    CloseReceived,
    /// Socket reached EOF or the listener force-closed the stream
    Closed,
}

pin_project! {
    /// Byte stream over WebSocket framing
    ///
    /// # Backpressure
    ///
    /// Encoded frames collect in a write buffer until flushed. Once the buffer
    /// exceeds the high water mark, further writes wait until it drains to
    /// the low water mark. Socket reads happen only when the reader polls
    /// and all decoded bytes were consumed.
    ///
    /// # Closing
    ///
    /// `poll_shutdown` sends a close frame (status 1000) before closing the
    /// socket's write side. A close frame from the peer ends the read side and
    /// shuts the socket down.
    pub struct WsStream<S> {
        #[pin]
        inner: S,
        codec: FrameCodec,
        parser: FrameParser,
        read_buf: BytesMut,
        pending: Bytes,
        write_buf: BytesMut,
        backpressure: Backpressure,
        max_frame_size: usize,
        state: StreamState,
        inner_shut: bool,
        activation: Option<Activation>,
        lifeline: Option<Lifeline>,
    }
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an upgraded socket
    pub fn new(inner: S, role: Role, config: &Config) -> Self {
        Self {
            inner,
            codec: FrameCodec::new(role),
            parser: FrameParser::new(config.max_frame_size),
            read_buf: BytesMut::with_capacity(RECV_BUFFER_SIZE),
            pending: Bytes::new(),
            write_buf: BytesMut::with_capacity(config.write_buffer_size),
            backpressure: Backpressure::new(config.high_water_mark, config.low_water_mark),
            max_frame_size: config.max_frame_size.max(1),
            state: StreamState::Open,
            inner_shut: false,
            activation: None,
            lifeline: None,
        }
    }

    /// Seed the read buffer with bytes the handshake read past the HTTP head
    pub fn with_leftover(mut self, leftover: Bytes) -> Self {
        self.read_buf.extend_from_slice(&leftover);
        self
    }

    /// Fire `activation` when the first data frame arrives
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    /// Tie the stream to a listener's shutdown
    pub fn with_lifeline(mut self, lifeline: Option<Lifeline>) -> Self {
        self.lifeline = lifeline;
        self
    }

    /// Role the codec frames for
    pub fn role(&self) -> Role {
        self.codec.role()
    }

    /// Token cancelled when the owning listener starts quiescing
    ///
    /// `None` for dialed streams, which no listener owns.
    pub fn drain_signal(&self) -> Option<&CancellationToken> {
        self.lifeline.as_ref().map(Lifeline::drain_signal)
    }

    /// Get a reference to the underlying socket
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Check if the stream can no longer carry data in either direction
    pub fn is_closed(&self) -> bool {
        matches!(
            self.state,
            StreamState::CloseReceived | StreamState::Closed
        )
    }

    /// Encoded bytes not yet written to the socket
    #[inline]
    pub fn write_buffer_len(&self) -> usize {
        self.write_buf.len()
    }

    /// Whether writers are parked on the high water mark
    #[inline]
    pub fn is_backpressured(&self) -> bool {
        self.backpressure.is_paused()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
}

/// Write buffered frames until at most `target` bytes remain.
fn poll_drain<S>(
    mut inner: Pin<&mut S>,
    cx: &mut Context<'_>,
    write_buf: &mut BytesMut,
    target: usize,
) -> Poll<io::Result<()>>
where
    S: AsyncWrite,
{
    while write_buf.len() > target {
        let n = ready!(inner.as_mut().poll_write(cx, &write_buf[..]))?;
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        write_buf.advance(n);
    }
    Poll::Ready(Ok(()))
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();

        if let Some(lifeline) = this.lifeline.as_mut() {
            if lifeline.poll_forced(cx) {
                if *this.state != StreamState::Closed {
                    tracing::debug!("stream force-closed by listener shutdown");
                    *this.state = StreamState::Closed;
                }
                if !*this.inner_shut {
                    *this.inner_shut = this.inner.as_mut().poll_shutdown(cx).is_ready();
                }
                return Poll::Ready(Ok(()));
            }
        }

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if matches!(
                *this.state,
                StreamState::CloseReceived | StreamState::Closed
            ) {
                return Poll::Ready(Ok(()));
            }

            let frame = match this.parser.parse(this.read_buf) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(error = %e, "malformed frame; closing stream");
                    *this.state = StreamState::Closed;
                    return Poll::Ready(Err(e.into()));
                }
            };

            if let Some(frame) = frame {
                match this.codec.decode(frame) {
                    Decoded::Data(data) => {
                        if let Some(activation) = this.activation.as_ref() {
                            activation.fire();
                        }
                        *this.pending = data;
                    }
                    Decoded::Close => {
                        *this.state = StreamState::CloseReceived;
                        this.write_buf.clear();
                        if !*this.inner_shut {
                            *this.inner_shut = this.inner.as_mut().poll_shutdown(cx).is_ready();
                        }
                        return Poll::Ready(Ok(()));
                    }
                    Decoded::Ignored => {}
                }
                continue;
            }

            if this.read_buf.capacity() - this.read_buf.len() < 4096 {
                this.read_buf.reserve(RECV_BUFFER_SIZE);
            }

            let n = ready!(tokio_util::io::poll_read_buf(
                this.inner.as_mut(),
                cx,
                this.read_buf
            ))?;
            if n == 0 {
                if this.parser.is_mid_frame() || !this.read_buf.is_empty() {
                    tracing::debug!(buffered = this.read_buf.len(), "socket closed mid-frame");
                }
                *this.state = StreamState::Closed;
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();

        if let Some(lifeline) = this.lifeline.as_mut() {
            if lifeline.poll_forced(cx) {
                *this.state = StreamState::Closed;
                return Poll::Ready(Err(closed_error()));
            }
        }
        if *this.state != StreamState::Open {
            return Poll::Ready(Err(closed_error()));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.backpressure.observe(this.write_buf.len()) {
            let low = this.backpressure.low_water_mark();
            ready!(poll_drain(this.inner.as_mut(), cx, this.write_buf, low))?;
            this.backpressure.observe(this.write_buf.len());
        }

        let n = data.len().min(*this.max_frame_size);
        this.codec.encode_into(&data[..n], this.write_buf);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();

        if let Some(lifeline) = this.lifeline.as_mut() {
            if lifeline.poll_forced(cx) {
                *this.state = StreamState::Closed;
                return Poll::Ready(Err(closed_error()));
            }
        }

        ready!(poll_drain(this.inner.as_mut(), cx, this.write_buf, 0))?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();

        if *this.inner_shut {
            return Poll::Ready(Ok(()));
        }

        if *this.state == StreamState::Open {
            this.codec.encode_close(NORMAL_CLOSURE, this.write_buf);
            *this.state = StreamState::CloseSent;
        }

        ready!(poll_drain(this.inner.as_mut(), cx, this.write_buf, 0))?;
        ready!(this.inner.as_mut().poll_flush(cx))?;
        ready!(this.inner.as_mut().poll_shutdown(cx))?;
        *this.inner_shut = true;
        Poll::Ready(Ok(()))
    }
}

impl<S> std::fmt::Debug for WsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsStream")
            .field("role", &self.codec.role())
            .field("state", &self.state)
            .field("buffered_read", &self.read_buf.len())
            .field("buffered_write", &self.write_buf.len())
            .finish_non_exhaustive()
    }
}
