//! Listener and dialer talking over loopback

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sockudo_p2p_ws::prelude::*;
use sockudo_p2p_ws::{BoxFuture, ListenerState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};

const PEER: &str = "QmcgpsyWgH8Y8ajJz1Cu72KnS5uo2Aa2LpzU7kinSupNKC";

#[derive(Debug)]
struct Conn {
    info: ConnectionInfo,
    channels: mpsc::UnboundedSender<(Direction, WsChannel)>,
    failures: Arc<Mutex<Vec<(Direction, String)>>>,
}

impl Connection for Conn {
    fn initialize_channel(&self, channel: WsChannel) -> BoxFuture<'_, Result<()>> {
        let _ = self.channels.send((self.info.direction, channel));
        Box::pin(async { Ok(()) })
    }

    fn closed_before_upgrade(&self, error: &Error) {
        self.failures
            .lock()
            .unwrap()
            .push((self.info.direction, error.to_string()));
    }
}

struct Manager {
    channels: mpsc::UnboundedSender<(Direction, WsChannel)>,
    created: Mutex<Vec<ConnectionInfo>>,
    failures: Arc<Mutex<Vec<(Direction, String)>>>,
}

impl ConnectionManager for Manager {
    type Connection = Conn;

    fn generate_connection(&self, info: ConnectionInfo) -> Arc<Conn> {
        self.created.lock().unwrap().push(info.clone());
        Arc::new(Conn {
            info,
            channels: self.channels.clone(),
            failures: Arc::clone(&self.failures),
        })
    }

    fn add_connection(&self, _connection: Arc<Conn>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

struct Harness {
    server: WsServer<Manager>,
    transport: WebSocketTransport<Manager>,
    manager: Arc<Manager>,
    channels: mpsc::UnboundedReceiver<(Direction, WsChannel)>,
}

impl Harness {
    async fn start(config: ServerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Manager {
            channels: tx,
            created: Mutex::new(Vec::new()),
            failures: Arc::new(Mutex::new(Vec::new())),
        });

        let mut server = WsServer::new(config, Arc::clone(&manager));
        server.start(Some(BindAddress::port(0))).await.unwrap();
        let transport = WebSocketTransport::new(Arc::clone(&manager), Config::default());

        Self {
            server,
            transport,
            manager,
            channels: rx,
        }
    }

    fn addr(&self) -> multiaddr::Multiaddr {
        self.server.listening_address().unwrap()
    }

    /// Wait for both ends of one dialed connection: (client, server)
    async fn pair(&mut self) -> (WsChannel, WsChannel) {
        let mut client = None;
        let mut server = None;
        while client.is_none() || server.is_none() {
            let (direction, channel) = timeout(Duration::from_secs(5), self.channels.recv())
                .await
                .expect("channel not delivered")
                .unwrap();
            match direction {
                Direction::Outbound => client = Some(channel),
                Direction::Inbound => server = Some(channel),
            }
        }
        (client.unwrap(), server.unwrap())
    }
}

#[tokio::test]
async fn test_hello_over_loopback() {
    let mut h = Harness::start(ServerConfig::default()).await;
    let addr = h.addr();
    assert!(h.transport.can_dial(&addr));

    let conn = h.transport.dial(&addr).await.unwrap();
    assert_eq!(conn.info.direction, Direction::Outbound);

    let (mut client, mut server) = h.pair().await;
    assert_eq!(client.role(), Role::Initiator);
    assert_eq!(server.role(), Role::Acceptor);

    client.write_all(b"hello").await.unwrap();
    client.flush().await.unwrap();
    let mut buf = [0u8; 5];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    server.write_all(b"world").await.unwrap();
    server.flush().await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    // close frame from the client ends the server's reads
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    server.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let inbound = h
        .manager
        .created
        .lock()
        .unwrap()
        .iter()
        .find(|info| info.direction == Direction::Inbound)
        .cloned()
        .unwrap();
    assert!(sockudo_p2p_ws::address::has_ws_marker(&inbound.remote_addr));
    assert!(inbound.expected_peer.is_none());

    drop((client, server));
    h.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_method_not_allowed_then_upgrade() {
    let mut h = Harness::start(ServerConfig::default()).await;
    let local = h.server.local_addr().unwrap();

    let mut socket = TcpStream::connect(local).await.unwrap();
    socket
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    socket.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 405"));
    assert!(response.contains("Content-Length: 0\r\n"));
    assert!(response.contains("Connection: close\r\n"));

    // the refused request does not disturb the next handshake
    let addr = h.addr();
    h.transport.dial(&addr).await.unwrap();
    let (mut client, mut server) = h.pair().await;
    client.write_all(b"after").await.unwrap();
    client.flush().await.unwrap();
    let mut buf = [0u8; 5];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after");

    let failures = h.manager.failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, Direction::Inbound);

    drop((client, server));
    h.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expected_peer_from_address() {
    let mut h = Harness::start(ServerConfig::default()).await;
    let addr = h
        .addr()
        .with(multiaddr::Protocol::P2p(PEER.parse().unwrap()));

    let conn = h.transport.dial_upgraded(&addr).await.unwrap();
    assert_eq!(conn.info.expected_peer, Some(PEER.parse().unwrap()));
    assert_eq!(conn.info.remote_addr, addr);

    let (client, server) = h.pair().await;
    drop((client, server));
    h.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_upgrade_reports_body() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "request cut short");
            request.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found")
            .await
            .unwrap();
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.map(|_| rest)
    });

    let (tx, _rx) = mpsc::unbounded_channel();
    let manager = Arc::new(Manager {
        channels: tx,
        created: Mutex::new(Vec::new()),
        failures: Arc::new(Mutex::new(Vec::new())),
    });
    let transport = WebSocketTransport::new(Arc::clone(&manager), Config::default());
    let addr = format!("/ip4/127.0.0.1/tcp/{}/ws", local.port())
        .parse()
        .unwrap();

    match transport.dial_upgraded(&addr).await {
        Err(Error::UpgradeRejected { status, body }) => {
            assert_eq!(status, 404);
            assert_eq!(body.as_ref(), b"not found");
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    let failures = manager.failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, Direction::Outbound);

    // the dialer closed the channel after the rejection
    let rest = timeout(Duration::from_secs(2), peer)
        .await
        .expect("rejected channel left open")
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_graceful_shutdown_waits_for_drain() {
    let mut h = Harness::start(ServerConfig::default()).await;
    let addr = h.addr();
    h.transport.dial(&addr).await.unwrap();
    let (_client, server) = h.pair().await;

    let drain = server.drain_signal().unwrap().clone();
    let finished = tokio::spawn(async move {
        drain.cancelled().await;
        drop(server);
    });

    let mut states = h.server.subscribe();
    let started = Instant::now();
    h.server.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(*states.borrow_and_update(), ListenerState::Closed);
    finished.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_timeout_force_closes() {
    let config = ServerConfig::builder()
        .shutdown_timeout(Duration::from_millis(200))
        .build();
    let mut h = Harness::start(config).await;
    let addr = h.addr();
    h.transport.dial(&addr).await.unwrap();
    let (_client, mut server) = h.pair().await;

    let started = Instant::now();
    let result = h.server.shutdown().await;
    assert!(matches!(result, Err(Error::ShutdownTimedOut(_))));
    assert!(started.elapsed() < Duration::from_millis(200) + Duration::from_secs(2));
    assert_eq!(h.server.state(), ListenerState::Closed);

    // the held stream is cut off
    let mut rest = Vec::new();
    let n = server.read_to_end(&mut rest).await.unwrap();
    assert_eq!(n, 0);
    assert!(server.write_all(b"late").await.is_err());
}

#[tokio::test]
async fn test_force_close_reaches_peer_of_idle_stream() {
    let config = ServerConfig::builder()
        .shutdown_timeout(Duration::from_millis(200))
        .build();
    let mut h = Harness::start(config).await;
    let addr = h.addr();
    h.transport.dial(&addr).await.unwrap();
    // the inbound stream is held but never polled again
    let (mut client, server) = h.pair().await;

    let result = h.server.shutdown().await;
    assert!(matches!(result, Err(Error::ShutdownTimedOut(_))));

    let mut rest = Vec::new();
    let read = timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "dialing peer still connected after force close");
    assert!(rest.is_empty());
    drop(server);
}

#[tokio::test]
async fn test_shutdown_cuts_off_pending_handshake() {
    let config = ServerConfig::builder()
        .shutdown_timeout(Duration::from_millis(200))
        .build();
    let mut h = Harness::start(config).await;

    // connects but never sends a request
    let mut socket = TcpStream::connect(h.server.local_addr().unwrap())
        .await
        .unwrap();
    timeout(Duration::from_secs(5), async {
        while h.manager.created.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection never accepted");

    let started = Instant::now();
    let result = h.server.shutdown().await;
    assert!(matches!(result, Err(Error::ShutdownTimedOut(_))));
    assert!(started.elapsed() < Duration::from_millis(200) + Duration::from_secs(2));
    assert_eq!(h.server.state(), ListenerState::Closed);

    let mut rest = Vec::new();
    let n = timeout(Duration::from_secs(2), socket.read_to_end(&mut rest))
        .await
        .expect("idle socket left open")
        .unwrap();
    assert_eq!(n, 0);
}
