use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{HandshakeState, Upgraded, read_head};
use crate::address::TcpTarget;
use crate::error::{Error, Result};
use crate::handshake::{build_request, generate_key, parse_response, validate_accept_key};

/// Largest rejection body kept for diagnostics
const MAX_REJECTION_BODY: usize = 8192;

/// Client side of the upgrade handshake
///
/// One instance per dial attempt. [`ClientNegotiator::run`] writes the
/// request as soon as it is called; nothing else is sent before the 101.
#[derive(Debug)]
pub struct ClientNegotiator {
    host: String,
    path: String,
    key: String,
    max_header_size: usize,
    state: HandshakeState,
}

impl ClientNegotiator {
    /// Create a negotiator for `target`; the Host header is its `ip:port`
    pub fn new(target: &TcpTarget, max_header_size: usize) -> Self {
        Self {
            host: target.host_header(),
            path: "/".to_string(),
            key: generate_key(),
            max_header_size,
            state: HandshakeState::NotStarted,
        }
    }

    /// Current handshake state
    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// The Sec-WebSocket-Key this attempt sends
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Run the handshake over a freshly connected `stream`.
    ///
    /// A non-101 answer is logged with its status and body, the stream is
    /// shut down and [`Error::UpgradeRejected`] is returned.
    pub async fn run<S>(&mut self, stream: &mut S) -> Result<Upgraded>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.negotiate(stream).await;
        match &result {
            Ok(_) => self.state.advance(HandshakeState::Upgraded),
            Err(e) => self.state.advance(HandshakeState::Failed(e.to_string())),
        }
        result
    }

    async fn negotiate<S>(&mut self, stream: &mut S) -> Result<Upgraded>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = build_request(&self.host, &self.path, &self.key);
        stream.write_all(&request).await?;
        stream.flush().await?;
        self.state.advance(HandshakeState::RequestSent);

        self.state.advance(HandshakeState::AwaitingResponse);
        let mut buf = BytesMut::with_capacity(1024);
        let (head, consumed) =
            read_head(stream, &mut buf, self.max_header_size, parse_response).await?;
        let mut rest = buf.split_off(consumed);

        if head.status != 101 {
            // without a length the body runs until the peer closes
            let want = head
                .content_length
                .unwrap_or(MAX_REJECTION_BODY)
                .min(MAX_REJECTION_BODY);
            while rest.len() < want {
                if stream.read_buf(&mut rest).await? == 0 {
                    break;
                }
            }
            rest.truncate(want);
            let body = rest.freeze();

            tracing::warn!(
                status = head.status,
                body = %String::from_utf8_lossy(&body),
                "websocket upgrade rejected"
            );
            // the attempt is over either way
            let _ = stream.shutdown().await;

            return Err(Error::UpgradeRejected {
                status: head.status,
                body,
            });
        }

        let accept = head
            .accept
            .as_deref()
            .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Accept"))?;
        if !validate_accept_key(&self.key, accept) {
            return Err(Error::HandshakeFailed("invalid Sec-WebSocket-Accept"));
        }

        tracing::trace!(host = %self.host, "websocket upgrade accepted");

        Ok(Upgraded {
            path: self.path.clone(),
            leftover: rest.freeze(),
        })
    }
}
