//! Upgrade negotiation
//!
//! Drives the HTTP/1.1 exchange that turns a fresh socket into a WebSocket:
//! - [`ClientNegotiator`] sends the upgrade request and interprets the answer
//! - [`ServerNegotiator`] answers 101, 405 or a bare 200 probe response
//!
//! Both track a [`HandshakeState`] that lives only until the attempt ends.

mod client;
mod server;

pub use client::ClientNegotiator;
pub use server::{Negotiated, ServerNegotiator};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// State of one connection-setup attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing exchanged yet
    NotStarted,
    /// Upgrade request written (client)
    RequestSent,
    /// Request head read (server)
    RequestReceived,
    /// Waiting for the server's response head (client)
    AwaitingResponse,
    /// Handshake complete; framing takes over
    Upgraded,
    /// Handshake ended without an upgrade
    Failed(String),
}

impl HandshakeState {
    /// Whether the attempt has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Upgraded | HandshakeState::Failed(_))
    }

    pub(crate) fn advance(&mut self, next: HandshakeState) {
        debug_assert!(!self.is_terminal(), "handshake already ended: {self:?}");
        tracing::trace!(from = ?self, to = ?next, "handshake state");
        *self = next;
    }
}

/// Outcome of a successful upgrade
#[derive(Debug, Clone)]
pub struct Upgraded {
    /// Request target of the upgrade
    pub path: String,
    /// Bytes read past the HTTP head; they belong to the first frames
    pub leftover: Bytes,
}

/// Read until `parse` yields a complete head or `max` bytes are buffered.
pub(crate) async fn read_head<S, T, F>(
    stream: &mut S,
    buf: &mut BytesMut,
    max: usize,
    parse: F,
) -> Result<(T, usize)>
where
    S: AsyncRead + Unpin,
    F: Fn(&[u8]) -> Result<Option<(T, usize)>>,
{
    loop {
        if let Some(parsed) = parse(&buf[..])? {
            return Ok(parsed);
        }
        if buf.len() >= max {
            return Err(Error::InvalidHttp("header section too large"));
        }

        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}
