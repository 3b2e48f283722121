use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::{HandshakeState, Upgraded, read_head};
use crate::error::Result;
use crate::handshake::{
    build_method_not_allowed, build_probe_response, build_response, generate_accept_key,
    parse_request,
};

/// How an inbound HTTP exchange ended
#[derive(Debug)]
pub enum Negotiated {
    /// 101 sent; the stream now carries frames
    Upgraded(Upgraded),
    /// Non-GET request answered with 405; the stream is shut down
    MethodNotAllowed,
    /// GET without upgrade headers answered with an empty 200; the stream is shut down
    Probed,
}

/// Server side of the upgrade handshake
///
/// Every GET that carries the opening-handshake headers is upgraded,
/// whatever its path. No subprotocol or extension is negotiated.
#[derive(Debug)]
pub struct ServerNegotiator {
    server_name: Option<Arc<str>>,
    max_header_size: usize,
    state: HandshakeState,
}

impl ServerNegotiator {
    /// Create a negotiator; `server_name` becomes the `Server` header of every answer
    pub fn new(server_name: Option<Arc<str>>, max_header_size: usize) -> Self {
        Self {
            server_name,
            max_header_size,
            state: HandshakeState::NotStarted,
        }
    }

    /// Current handshake state
    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Read one request from `stream` and answer it.
    pub async fn run<S>(&mut self, stream: &mut S) -> Result<Negotiated>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.negotiate(stream).await;
        let next = match &result {
            Ok(Negotiated::Upgraded(_)) => HandshakeState::Upgraded,
            Ok(Negotiated::MethodNotAllowed) => HandshakeState::Failed("method not allowed".into()),
            Ok(Negotiated::Probed) => HandshakeState::Failed("request did not ask for an upgrade".into()),
            Err(e) => HandshakeState::Failed(e.to_string()),
        };
        self.state.advance(next);
        result
    }

    async fn negotiate<S>(&mut self, stream: &mut S) -> Result<Negotiated>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(1024);
        let (head, consumed) =
            read_head(stream, &mut buf, self.max_header_size, parse_request).await?;
        self.state.advance(HandshakeState::RequestReceived);

        let server_name = self.server_name.as_deref();

        if head.method != "GET" {
            tracing::debug!(method = %head.method, "rejecting non-GET request");
            respond_and_close(stream, build_method_not_allowed(server_name)).await?;
            return Ok(Negotiated::MethodNotAllowed);
        }

        let key = match head.key.as_deref() {
            Some(key) if head.is_websocket_upgrade() => key,
            _ => {
                tracing::debug!(path = %head.path, "GET without upgrade headers");
                respond_and_close(stream, build_probe_response(server_name)).await?;
                return Ok(Negotiated::Probed);
            }
        };

        let accept = generate_accept_key(key);
        stream.write_all(&build_response(&accept, server_name)).await?;
        stream.flush().await?;

        tracing::trace!(path = %head.path, "websocket upgrade completed");

        Ok(Negotiated::Upgraded(Upgraded {
            path: head.path,
            leftover: buf.split_off(consumed).freeze(),
        }))
    }
}

/// Write a final response, flush it, then close the write side.
async fn respond_and_close<S>(stream: &mut S, response: Bytes) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&response).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{build_request, generate_key, parse_response};
    use tokio::io::{AsyncReadExt, duplex};

    async fn exchange(request: &'static [u8]) -> (Result<Negotiated>, HandshakeState, Vec<u8>) {
        let (mut client, mut server) = duplex(4096);
        client.write_all(request).await.unwrap();

        let mut negotiator = ServerNegotiator::new(Some(Arc::from("test-node")), 8192);
        let result = negotiator.run(&mut server).await;
        let state = negotiator.state().clone();
        drop(server);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        (result, state, response)
    }

    #[tokio::test]
    async fn test_upgrade() {
        let key = generate_key();
        let request = build_request("127.0.0.1:10001", "/any/path", &key);
        let (mut client, mut server) = duplex(4096);
        client.write_all(&request).await.unwrap();
        client.write_all(&[0x82, 0x80, 1, 2, 3, 4]).await.unwrap();

        let mut negotiator = ServerNegotiator::new(None, 8192);
        let negotiated = negotiator.run(&mut server).await.unwrap();
        assert_eq!(negotiator.state(), &HandshakeState::Upgraded);

        let upgraded = match negotiated {
            Negotiated::Upgraded(upgraded) => upgraded,
            other => panic!("expected upgrade, got {other:?}"),
        };
        assert_eq!(upgraded.path, "/any/path");
        assert_eq!(upgraded.leftover.as_ref(), &[0x82, 0x80, 1, 2, 3, 4]);

        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let (head, _) = parse_response(&buf[..n]).unwrap().unwrap();
        assert_eq!(head.status, 101);
        assert_eq!(
            head.accept.as_deref(),
            Some(generate_accept_key(&key).as_str())
        );
    }

    #[tokio::test]
    async fn test_non_get_gets_405() {
        let (result, state, response) =
            exchange(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n").await;

        assert!(matches!(result, Ok(Negotiated::MethodNotAllowed)));
        assert!(matches!(state, HandshakeState::Failed(_)));

        let (head, len) = parse_response(&response).unwrap().unwrap();
        assert_eq!(head.status, 405);
        assert_eq!(head.content_length, Some(0));
        assert_eq!(len, response.len());
        let text = String::from_utf8(response).unwrap();
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Server: test-node\r\n"));
    }

    #[tokio::test]
    async fn test_plain_get_gets_probe_response() {
        let (result, _, response) = exchange(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n").await;

        assert!(matches!(result, Ok(Negotiated::Probed)));
        let (head, _) = parse_response(&response).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length, Some(0));
        assert!(String::from_utf8(response).unwrap().contains("Content-Type: text/html"));
    }

    #[tokio::test]
    async fn test_garbage_fails() {
        let (result, state, response) = exchange(b"\x00\x01\x02 not http\r\n\r\n").await;
        assert!(result.is_err());
        assert!(matches!(state, HandshakeState::Failed(_)));
        assert!(response.is_empty());
    }
}
