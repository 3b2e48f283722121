//! WebSocket listener
//!
//! [`WsServer`] binds a TCP port (or a Unix socket path), accepts channels,
//! runs a fresh [`ServerNegotiator`] on each one and binds upgraded channels
//! to connections created by the host's [`ConnectionManager`].
//!
//! # Lifecycle
//!
//! `Idle -> Bound -> Accepting -> Quiescing -> Closed`, never backwards.
//! [`WsServer::shutdown`] stops accepting, raises the drain signal on every
//! established stream and waits for them to finish. Streams still open when
//! the shutdown timeout expires are force-closed.
//!
//! # Example
//!
//! ```ignore
//! use sockudo_p2p_ws::{ServerConfig, WsServer};
//!
//! let config = ServerConfig::builder()
//!     .hostname("0.0.0.0")
//!     .port(10001)
//!     .server_name("node-1")
//!     .build();
//!
//! let mut server = WsServer::new(config, manager);
//! server.start(None).await?;
//! println!("listening on {}", server.listening_address()?);
//!
//! server.shutdown().await?;
//! ```

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use multiaddr::Multiaddr;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::Config;
use crate::address;
use crate::binder;
use crate::codec::Role;
use crate::connection::{Connection, ConnectionInfo, ConnectionManager, Direction};
use crate::error::{Error, Result};
use crate::negotiate::{Negotiated, ServerNegotiator};
use crate::shutdown::{Lifeline, ShutdownSignals};
use crate::stream::{Channel, ChannelCloser};

#[cfg(all(unix, feature = "unix-socket"))]
use tokio::net::UnixListener;

/// Name the listener registers under
pub const SERVER_KEY: &str = "WS";

/// Hostname bound when neither the override nor the configuration names one
pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";

/// Port bound when neither the override nor the configuration names one
pub const DEFAULT_PORT: u16 = 10001;

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 256;

/// Default time granted to in-flight connections on shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept, so fd exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// Configuration
// ============================================================================

/// Where the listener binds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddress {
    /// TCP address; missing parts fall back to the configuration, then the defaults
    Hostname {
        host: Option<String>,
        port: Option<u16>,
    },
    /// Filesystem socket path (unix only)
    UnixSocket(PathBuf),
}

impl BindAddress {
    /// Fully specified TCP address
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        BindAddress::Hostname {
            host: Some(host.into()),
            port: Some(port),
        }
    }

    /// Override only the port
    pub fn port(port: u16) -> Self {
        BindAddress::Hostname {
            host: None,
            port: Some(port),
        }
    }

    /// Filesystem socket path
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        BindAddress::UnixSocket(path.into())
    }
}

impl Default for BindAddress {
    fn default() -> Self {
        BindAddress::Hostname {
            host: None,
            port: None,
        }
    }
}

/// Bind target after applying override, configuration and defaults
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolved {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

/// Apply `override > configured > defaults`.
fn resolve(over: Option<&BindAddress>, configured: &BindAddress) -> Resolved {
    let (cfg_host, cfg_port) = match configured {
        BindAddress::Hostname { host, port } => (host.as_deref(), *port),
        BindAddress::UnixSocket(path) if over.is_none() => return Resolved::Unix(path.clone()),
        BindAddress::UnixSocket(_) => (None, None),
    };

    match over {
        Some(BindAddress::UnixSocket(path)) => Resolved::Unix(path.clone()),
        Some(BindAddress::Hostname { host, port }) => Resolved::Tcp {
            host: host
                .as_deref()
                .or(cfg_host)
                .unwrap_or(DEFAULT_HOSTNAME)
                .to_string(),
            port: port.or(cfg_port).unwrap_or(DEFAULT_PORT),
        },
        None => Resolved::Tcp {
            host: cfg_host.unwrap_or(DEFAULT_HOSTNAME).to_string(),
            port: cfg_port.unwrap_or(DEFAULT_PORT),
        },
    }
}

/// Listener configuration, fixed once handed to [`WsServer::new`]
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `127.0.0.1:10001`)
    pub address: BindAddress,
    /// Listen backlog (default: 256)
    pub backlog: u32,
    /// Set SO_REUSEADDR on the listening socket (default: true)
    pub reuse_address: bool,
    /// Set TCP_NODELAY on accepted sockets (default: true)
    pub tcp_nodelay: bool,
    /// `Server` header of every HTTP response the listener writes
    pub server_name: Option<Arc<str>>,
    /// Parent span for the listener's logs
    pub span: Option<tracing::Span>,
    /// Time granted to in-flight connections on shutdown (default: 10s)
    pub shutdown_timeout: Duration,
    /// Stream configuration applied to upgraded connections
    pub stream: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: BindAddress::default(),
            backlog: DEFAULT_BACKLOG,
            reuse_address: true,
            tcp_nodelay: true,
            server_name: None,
            span: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            stream: Config::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

/// Builder for [`ServerConfig`]
///
/// Setters may be called in any order; the last write wins.
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Start from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hostname; replaces a Unix socket path
    pub fn hostname(mut self, host: impl Into<String>) -> Self {
        let port = match self.config.address {
            BindAddress::Hostname { port, .. } => port,
            BindAddress::UnixSocket(_) => None,
        };
        self.config.address = BindAddress::Hostname {
            host: Some(host.into()),
            port,
        };
        self
    }

    /// Set the port; replaces a Unix socket path
    pub fn port(mut self, port: u16) -> Self {
        let host = match std::mem::take(&mut self.config.address) {
            BindAddress::Hostname { host, .. } => host,
            BindAddress::UnixSocket(_) => None,
        };
        self.config.address = BindAddress::Hostname {
            host,
            port: Some(port),
        };
        self
    }

    /// Bind a filesystem socket instead of a TCP port
    pub fn unix_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.address = BindAddress::UnixSocket(path.into());
        self
    }

    /// Set the listen backlog
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// Enable or disable SO_REUSEADDR on the listening socket
    pub fn reuse_address(mut self, enabled: bool) -> Self {
        self.config.reuse_address = enabled;
        self
    }

    /// Enable or disable TCP_NODELAY on accepted sockets
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    /// Set the `Server` header value
    pub fn server_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.config.server_name = Some(name.into());
        self
    }

    /// Log under `span`
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.config.span = Some(span);
        self
    }

    /// Set how long `shutdown` waits before force-closing connections
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Set the stream configuration for upgraded connections
    pub fn stream_config(mut self, config: Config) -> Self {
        self.config.stream = config;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

// ============================================================================
// Listener state
// ============================================================================

/// Listener lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Created, not started
    Idle,
    /// Socket bound, accept loop not yet running
    Bound,
    /// Accepting channels
    Accepting,
    /// No new channels; in-flight connections have until `deadline`
    Quiescing { deadline: Instant },
    /// Shut down
    Closed,
}

#[derive(Debug, Clone)]
enum LocalAddr {
    Tcp(SocketAddr),
    #[cfg_attr(not(all(unix, feature = "unix-socket")), allow(dead_code))]
    Unix(PathBuf),
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(all(unix, feature = "unix-socket"))]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Accept one channel; the remote address is `Err` when it cannot be expressed
    async fn accept(&self, nodelay: bool) -> io::Result<(Channel, Result<Multiaddr>)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(nodelay) {
                    tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                }
                Ok((Channel::new(stream), Ok(address::socket_to_multiaddr(peer))))
            }
            #[cfg(all(unix, feature = "unix-socket"))]
            Listener::Unix(listener, path) => {
                let (stream, peer) = listener.accept().await?;
                // unnamed client sockets are identified by the listening path
                let remote =
                    address::unix_to_multiaddr(peer.as_pathname().unwrap_or(path.as_path()));
                Ok((Channel::new(stream), remote))
            }
        }
    }
}

/// State shared by the accept loop and connection tasks
struct Shared<M: ConnectionManager> {
    config: ServerConfig,
    manager: Arc<M>,
    stop: CancellationToken,
    signals: ShutdownSignals,
    tracker: TaskTracker,
    /// Close handles for every accepted socket, pruned as channels drop
    open: Mutex<Vec<ChannelCloser>>,
}

impl<M: ConnectionManager> Shared<M> {
    fn track(&self, channel: &Channel) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.retain(ChannelCloser::is_live);
        open.push(channel.closer());
    }

    /// Close every socket still open, wherever its stream lives now
    fn close_all(&self) -> usize {
        let open = {
            let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *open)
        };
        open.iter().filter(|closer| closer.close()).count()
    }
}

// ============================================================================
// WsServer
// ============================================================================

/// WebSocket listener
///
/// Must be shut down with [`WsServer::shutdown`] once started; dropping a
/// started listener is a contract violation and asserts in debug builds.
pub struct WsServer<M: ConnectionManager> {
    shared: Arc<Shared<M>>,
    state: watch::Sender<ListenerState>,
    local: Option<LocalAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl<M: ConnectionManager> WsServer<M> {
    /// Registry key of the listener
    pub const KEY: &'static str = SERVER_KEY;

    /// Create an idle listener; `config` is fixed from here on
    pub fn new(config: ServerConfig, manager: Arc<M>) -> Self {
        let (state, _) = watch::channel(ListenerState::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                manager,
                stop: CancellationToken::new(),
                signals: ShutdownSignals::new(),
                tracker: TaskTracker::new(),
                open: Mutex::new(Vec::new()),
            }),
            state,
            local: None,
            accept_task: None,
        }
    }

    /// Get the listener configuration
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions, e.g. to await `Closed`
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Bound TCP address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.local {
            Some(LocalAddr::Tcp(addr)) => Some(addr),
            _ => None,
        }
    }

    /// Address peers dial to reach this listener
    ///
    /// Before [`start`](Self::start) this is derived from the configuration;
    /// afterwards from the bound socket, so port 0 resolves to the real port.
    pub fn listening_address(&self) -> Result<Multiaddr> {
        match &self.local {
            Some(LocalAddr::Tcp(addr)) => Ok(address::socket_to_multiaddr(*addr)),
            Some(LocalAddr::Unix(path)) => address::unix_to_multiaddr(path),
            None => match resolve(None, &self.shared.config.address) {
                Resolved::Tcp { host, port } => Ok(address::host_to_multiaddr(&host, port)),
                Resolved::Unix(path) => address::unix_to_multiaddr(&path),
            },
        }
    }

    /// Bind and start accepting.
    ///
    /// `bind` overrides the configured address; missing host or port parts
    /// fall back to the configuration, then to `127.0.0.1:10001`.
    pub async fn start(&mut self, bind: Option<BindAddress>) -> Result<()> {
        if self.state() != ListenerState::Idle {
            return Err(Error::InvalidState("listener already started"));
        }

        let span = self
            .shared
            .config
            .span
            .clone()
            .unwrap_or_else(|| tracing::info_span!("ws_listener"));

        let (listener, local) = self
            .bind(resolve(bind.as_ref(), &self.shared.config.address))
            .instrument(span.clone())
            .await?;
        self.local = Some(local);
        self.state.send_replace(ListenerState::Bound);
        span.in_scope(|| {
            tracing::info!(address = ?self.listening_address().ok(), "websocket listener bound");
        });

        let accept = accept_loop(listener, Arc::clone(&self.shared)).instrument(span);
        self.accept_task = Some(tokio::spawn(accept));
        self.state.send_replace(ListenerState::Accepting);
        Ok(())
    }

    async fn bind(&self, target: Resolved) -> Result<(Listener, LocalAddr)> {
        match target {
            Resolved::Tcp { host, port } => {
                let addr = tokio::net::lookup_host((host.as_str(), port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("{host} did not resolve to an address"),
                        )
                    })?;

                let socket = match addr {
                    SocketAddr::V4(_) => TcpSocket::new_v4()?,
                    SocketAddr::V6(_) => TcpSocket::new_v6()?,
                };
                socket.set_reuseaddr(self.shared.config.reuse_address)?;
                socket.bind(addr)?;
                let listener = socket.listen(self.shared.config.backlog)?;
                let local = listener.local_addr()?;
                tracing::debug!(%local, backlog = self.shared.config.backlog, "tcp socket bound");
                Ok((Listener::Tcp(listener), LocalAddr::Tcp(local)))
            }
            #[cfg(all(unix, feature = "unix-socket"))]
            Resolved::Unix(path) => {
                let listener = UnixListener::bind(&path)?;
                tracing::debug!(path = %path.display(), "unix socket bound");
                Ok((
                    Listener::Unix(listener, path.clone()),
                    LocalAddr::Unix(path),
                ))
            }
            #[cfg(not(all(unix, feature = "unix-socket")))]
            Resolved::Unix(_) => Err(Error::NotYetImplemented("unix socket listeners")),
        }
    }

    /// Quiesce and close the listener.
    ///
    /// Stops accepting, signals drain to established streams and waits for
    /// them. If they are still open when the shutdown timeout expires they
    /// are force-closed and [`Error::ShutdownTimedOut`] is returned; the
    /// listener is `Closed` either way.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self.state() {
            ListenerState::Closed => return Ok(()),
            ListenerState::Idle => {
                self.state.send_replace(ListenerState::Closed);
                return Ok(());
            }
            _ => {}
        }

        let timeout = self.shared.config.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        self.state
            .send_replace(ListenerState::Quiescing { deadline });
        tracing::info!(?timeout, "websocket listener quiescing");

        let shared = Arc::clone(&self.shared);
        shared.stop.cancel();
        shared.signals.drain.cancel();
        shared.tracker.close();

        let accept_task = self.accept_task.take();
        let drained = tokio::time::timeout_at(deadline, async {
            if let Some(task) = accept_task {
                if let Err(e) = task.await {
                    tracing::error!(error = %e, "accept loop panicked");
                }
            }
            shared.tracker.wait().await;
        })
        .await;

        let result = match drained {
            Ok(()) => Ok(()),
            Err(_) => {
                shared.signals.force.cancel();
                let closed = shared.close_all();
                tracing::warn!(
                    ?timeout,
                    remaining = shared.tracker.len(),
                    closed,
                    "stop took too long; force-closing connections"
                );
                Err(Error::ShutdownTimedOut(timeout))
            }
        };

        if let Some(LocalAddr::Unix(path)) = &self.local {
            remove_socket_file(path);
        }

        self.state.send_replace(ListenerState::Closed);
        tracing::info!("websocket listener closed");
        result
    }
}

impl<M: ConnectionManager> std::fmt::Debug for WsServer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("state", &self.state())
            .field("local", &self.local)
            .field("connections", &self.shared.tracker.len())
            .finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> Drop for WsServer<M> {
    fn drop(&mut self) {
        let state = self.state();
        if !std::thread::panicking() {
            debug_assert!(
                matches!(state, ListenerState::Idle | ListenerState::Closed),
                "WsServer dropped without shutdown (state: {state:?})"
            );
        }
        self.shared.stop.cancel();
        self.shared.signals.force.cancel();
        self.shared.close_all();
    }
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "unix socket removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove unix socket"),
    }
}

// ============================================================================
// Accept path
// ============================================================================

async fn accept_loop<M: ConnectionManager>(listener: Listener, shared: Arc<Shared<M>>) {
    let nodelay = shared.config.tcp_nodelay;
    loop {
        let accepted = tokio::select! {
            _ = shared.stop.cancelled() => break,
            accepted = listener.accept(nodelay) => accepted,
        };

        match accepted {
            Ok((channel, remote)) => {
                let task = serve_connection(Arc::clone(&shared), channel, remote);
                shared.tracker.spawn(task.in_current_span());
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                tokio::select! {
                    _ = shared.stop.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

async fn serve_connection<M: ConnectionManager>(
    shared: Arc<Shared<M>>,
    mut channel: Channel,
    remote: Result<Multiaddr>,
) {
    shared.track(&channel);
    let remote_addr = match remote {
        Ok(addr) => addr,
        Err(e) => {
            tracing::warn!(error = %e, "dropping channel with unusable remote address");
            return;
        }
    };

    let conn = shared.manager.generate_connection(ConnectionInfo {
        direction: Direction::Inbound,
        remote_addr,
        expected_peer: None,
    });
    let span = conn.span();
    let force = shared.signals.force.clone();

    let setup = async move {
        let mut negotiator = ServerNegotiator::new(
            shared.config.server_name.clone(),
            shared.config.stream.max_header_size,
        );

        // registration runs alongside the HTTP exchange
        let (registered, negotiated) = tokio::join!(
            shared.manager.add_connection(Arc::clone(&conn)),
            negotiator.run(&mut channel),
        );

        if let Err(e) = registered {
            tracing::debug!(error = %e, "connection registration failed");
            conn.closed_before_upgrade(&e);
            return;
        }

        let upgraded = match negotiated {
            Ok(Negotiated::Upgraded(upgraded)) => upgraded,
            Ok(Negotiated::MethodNotAllowed) => {
                conn.closed_before_upgrade(&Error::HandshakeFailed("method not allowed"));
                return;
            }
            Ok(Negotiated::Probed) => {
                conn.closed_before_upgrade(&Error::HandshakeFailed("no upgrade requested"));
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "inbound upgrade failed");
                conn.closed_before_upgrade(&e);
                return;
            }
        };

        tracing::debug!(path = %upgraded.path, "inbound websocket upgraded");
        let lifeline = Lifeline::new(&shared.tracker, &shared.signals);
        if let Err(e) = binder::bind(
            conn,
            channel,
            Role::Acceptor,
            upgraded.leftover,
            &shared.config.stream,
            Some(lifeline),
        )
        .await
        {
            tracing::debug!(error = %e, "connection initialization failed");
        }
    };

    tokio::select! {
        _ = force.cancelled() => {
            tracing::debug!("connection setup cut off by shutdown");
        }
        _ = setup.instrument(span) => {}
    }
}
