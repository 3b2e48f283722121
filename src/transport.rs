//! Dialing facade
//!
//! [`WebSocketTransport`] is the transport a host application selects under
//! [`TRANSPORT_KEY`]. It dials `/ip4/<addr>/tcp/<port>/ws` addresses and hands
//! each new connection to the host's [`ConnectionManager`]. Listening is the
//! job of [`WsServer`](crate::WsServer).
//!
//! # Example
//!
//! ```ignore
//! use sockudo_p2p_ws::{Config, WebSocketTransport};
//!
//! let transport = WebSocketTransport::new(manager, Config::default());
//! let addr = "/ip4/127.0.0.1/tcp/10001/ws".parse()?;
//! if transport.can_dial(&addr) {
//!     let conn = transport.dial(&addr).await?;
//! }
//! ```

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, OnceLock};

use multiaddr::Multiaddr;
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::Config;
use crate::address::{self, TcpTarget};
use crate::binder;
use crate::codec::Role;
use crate::connection::{Connection, ConnectionInfo, ConnectionManager, Direction};
use crate::error::{Error, Result};
use crate::negotiate::ClientNegotiator;
use crate::server::WsServer;
use crate::stream::Channel;

/// Name the transport registers under
pub const TRANSPORT_KEY: &str = "websockets";

// ============================================================================
// TcpConnector
// ============================================================================

/// Opens outbound TCP sockets with the transport's socket options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpConnector {
    reuse_address: bool,
    nodelay: bool,
}

impl TcpConnector {
    /// Take socket options from the stream configuration
    pub fn new(config: &Config) -> Self {
        Self {
            reuse_address: config.reuse_address,
            nodelay: config.tcp_nodelay,
        }
    }

    /// Connect to an IPv4 endpoint
    pub async fn connect(&self, addr: SocketAddrV4) -> Result<TcpStream> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(self.reuse_address)?;
        let stream = socket.connect(SocketAddr::V4(addr)).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Dial-only WebSocket transport
pub struct WebSocketTransport<M: ConnectionManager> {
    manager: Arc<M>,
    config: Config,
    connector: OnceLock<TcpConnector>,
}

impl<M: ConnectionManager> WebSocketTransport<M> {
    /// Registry key of this transport
    pub const KEY: &'static str = TRANSPORT_KEY;

    /// Create a dialer; the TCP connector is built on first use
    pub fn new(manager: Arc<M>, config: Config) -> Self {
        Self {
            manager,
            config,
            connector: OnceLock::new(),
        }
    }

    /// Stream configuration applied to dialed connections
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether `addr` is an IPv4 TCP address carrying the `ws` marker.
    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        address::is_dialable(addr)
    }

    /// Shared connector, built on first use
    pub fn connector(&self) -> &TcpConnector {
        self.connector.get_or_init(|| {
            tracing::trace!("building tcp connector");
            TcpConnector::new(&self.config)
        })
    }

    /// Dial `addr` and return the connection once it is registered.
    ///
    /// Resolves as soon as the manager has accepted the connection and the
    /// upgrade request is on its way; the handshake finishes in the
    /// background. A rejected upgrade is reported to the connection through
    /// [`Connection::closed_before_upgrade`], never to this future.
    pub async fn dial(&self, addr: &Multiaddr) -> Result<Arc<M::Connection>> {
        let (conn, _upgrade) = self.start_dial(addr).await?;
        Ok(conn)
    }

    /// Dial `addr` and wait until the connection's stack is initialized.
    ///
    /// Unlike [`dial`](Self::dial), a non-101 answer fails the call with
    /// [`Error::UpgradeRejected`].
    pub async fn dial_upgraded(&self, addr: &Multiaddr) -> Result<Arc<M::Connection>> {
        let (conn, upgrade) = self.start_dial(addr).await?;
        upgrade.await.map_err(|e| Error::Io(io::Error::other(e)))??;
        Ok(conn)
    }

    /// Listening is not offered by the dialing facade.
    pub async fn listen(&self, addr: &Multiaddr) -> Result<WsServer<M>> {
        tracing::debug!(%addr, "listen requested on the dial transport");
        Err(Error::NotYetImplemented(
            "listening through the dial transport",
        ))
    }

    async fn start_dial(
        &self,
        addr: &Multiaddr,
    ) -> Result<(Arc<M::Connection>, JoinHandle<Result<()>>)> {
        let target = TcpTarget::from_multiaddr(addr)?;
        let stream = self.connector().connect(target.addr).await.inspect_err(|e| {
            tracing::debug!(%addr, error = %e, "tcp connect failed");
        })?;

        let conn = self.manager.generate_connection(ConnectionInfo {
            direction: Direction::Outbound,
            remote_addr: addr.clone(),
            expected_peer: target.expected_peer,
        });

        let span = conn.span();
        let upgrade = tokio::spawn(
            upgrade_outbound(Arc::clone(&conn), stream, target, self.config.clone())
                .instrument(span),
        );

        if let Err(e) = self.manager.add_connection(Arc::clone(&conn)).await {
            upgrade.abort();
            return Err(e);
        }

        Ok((conn, upgrade))
    }
}

impl<M: ConnectionManager> std::fmt::Debug for WebSocketTransport<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("config", &self.config)
            .field("connector", &self.connector.get())
            .finish_non_exhaustive()
    }
}

async fn upgrade_outbound<C: Connection>(
    conn: Arc<C>,
    mut stream: TcpStream,
    target: TcpTarget,
    config: Config,
) -> Result<()> {
    let mut negotiator = ClientNegotiator::new(&target, config.max_header_size);
    let upgraded = match negotiator.run(&mut stream).await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            tracing::debug!(peer = %target.addr, error = %e, "outbound upgrade failed");
            conn.closed_before_upgrade(&e);
            return Err(e);
        }
    };

    tracing::debug!(peer = %target.addr, "outbound websocket upgraded");
    binder::bind(
        conn,
        Channel::new(stream),
        Role::Initiator,
        upgraded.leftover,
        &config,
        None,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::BoxFuture;
    use crate::negotiate::{Negotiated, ServerNegotiator};
    use crate::stream::{WsChannel, WsStream};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct TestConn {
        info: ConnectionInfo,
        channels: mpsc::UnboundedSender<WsChannel>,
    }

    impl Connection for TestConn {
        fn initialize_channel(&self, channel: WsChannel) -> BoxFuture<'_, Result<()>> {
            let _ = self.channels.send(channel);
            Box::pin(async { Ok(()) })
        }
    }

    struct TestManager {
        channels: mpsc::UnboundedSender<WsChannel>,
        added: Mutex<usize>,
    }

    impl ConnectionManager for TestManager {
        type Connection = TestConn;

        fn generate_connection(&self, info: ConnectionInfo) -> Arc<TestConn> {
            Arc::new(TestConn {
                info,
                channels: self.channels.clone(),
            })
        }

        fn add_connection(&self, _connection: Arc<TestConn>) -> BoxFuture<'_, Result<()>> {
            *self.added.lock().unwrap() += 1;
            Box::pin(async { Ok(()) })
        }
    }

    fn transport() -> (
        WebSocketTransport<TestManager>,
        mpsc::UnboundedReceiver<WsChannel>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(TestManager {
            channels: tx,
            added: Mutex::new(0),
        });
        (WebSocketTransport::new(manager, Config::default()), rx)
    }

    fn ws_addr(addr: SocketAddr) -> Multiaddr {
        format!("/ip4/{}/tcp/{}/ws", addr.ip(), addr.port())
            .parse()
            .unwrap()
    }

    #[test]
    fn test_can_dial() {
        let (transport, _rx) = transport();
        assert_eq!(WebSocketTransport::<TestManager>::KEY, "websockets");
        assert!(transport.can_dial(&"/ip4/127.0.0.1/tcp/10001/ws".parse().unwrap()));
        assert!(!transport.can_dial(&"/ip6/::1/tcp/10001/ws".parse().unwrap()));
        assert!(!transport.can_dial(&"/ip4/127.0.0.1/tcp/10001".parse().unwrap()));
    }

    #[test]
    fn test_connector_is_built_once() {
        let (transport, _rx) = transport();
        let first: *const TcpConnector = transport.connector();
        let second: *const TcpConnector = transport.connector();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_dial_invalid_address() {
        let (transport, _rx) = transport();
        let result = transport
            .dial(&"/ip4/127.0.0.1/tcp/10001".parse().unwrap())
            .await;
        assert!(matches!(result, Err(Error::InvalidMultiaddr(_))));
        assert_eq!(*transport.manager.added.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (transport, _rx) = transport();
        let result = transport.dial(&ws_addr(addr)).await;
        assert!(result.is_err());
        assert_eq!(*transport.manager.added.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_listen_not_implemented() {
        let (transport, _rx) = transport();
        let result = transport
            .listen(&"/ip4/127.0.0.1/tcp/0/ws".parse().unwrap())
            .await;
        assert!(matches!(result, Err(Error::NotYetImplemented(_))));
    }

    #[tokio::test]
    async fn test_dial_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut negotiator = ServerNegotiator::new(None, 8192);
            let upgraded = match negotiator.run(&mut socket).await.unwrap() {
                Negotiated::Upgraded(upgraded) => upgraded,
                other => panic!("expected upgrade, got {other:?}"),
            };
            let mut ws = WsStream::new(socket, Role::Acceptor, &Config::default())
                .with_leftover(upgraded.leftover);
            let mut buf = [0u8; 5];
            ws.read_exact(&mut buf).await.unwrap();
            ws.write_all(&buf).await.unwrap();
            ws.flush().await.unwrap();
        });

        let (transport, mut rx) = transport();
        let conn = transport.dial(&ws_addr(addr)).await.unwrap();
        assert_eq!(conn.info.direction, Direction::Outbound);
        assert_eq!(conn.info.remote_addr, ws_addr(addr));
        assert_eq!(*transport.manager.added.lock().unwrap(), 1);

        let mut channel = rx.recv().await.unwrap();
        assert_eq!(channel.role(), Role::Initiator);
        channel.write_all(b"hello").await.unwrap();
        channel.flush().await.unwrap();

        let mut echo = [0u8; 5];
        channel.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_upgraded_reports_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\n\r\nno way")
                .await
                .unwrap();
        });

        let (transport, _rx) = transport();
        match transport.dial_upgraded(&ws_addr(addr)).await {
            Err(Error::UpgradeRejected { status, body }) => {
                assert_eq!(status, 403);
                assert_eq!(body.as_ref(), b"no way");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
