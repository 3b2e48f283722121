//! # sockudo-p2p-ws: WebSocket transport for peer-to-peer stacks
//!
//! Carries a reliable, ordered byte stream between two peers over an
//! HTTP/1.1-upgraded WebSocket connection, so a p2p stack can run its
//! security and multiplexing protocols where only HTTP-shaped traffic passes.
//!
//! ## Layers
//!
//! - **Framing**: RFC 6455 frames, role-driven masking ([`codec::FrameCodec`])
//! - **Upgrade negotiation**: client and server HTTP/1.1 handshakes ([`negotiate`])
//! - **Binding**: splices the codec under an external [`Connection`] ([`binder`])
//! - **Dialing**: multiaddr-driven outbound connections ([`WebSocketTransport`])
//! - **Listening**: bind, accept and quiescing shutdown ([`WsServer`])
//!
//! ## Example
//!
//! ```ignore
//! use sockudo_p2p_ws::{ServerConfig, WsServer, WebSocketTransport, Config};
//!
//! let mut server = WsServer::new(ServerConfig::builder().port(10001).build(), manager.clone());
//! server.start(None).await?;
//!
//! let transport = WebSocketTransport::new(manager, Config::default());
//! let conn = transport.dial(&"/ip4/127.0.0.1/tcp/10001/ws".parse()?).await?;
//!
//! server.shutdown().await?;
//! ```

pub mod address;
pub mod backpressure;
pub mod binder;
pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod negotiate;
pub mod server;
pub mod shutdown;
pub mod stream;
pub mod transport;

pub use binder::Activation;
pub use codec::{Decoded, FrameCodec, Role};
pub use connection::{BoxFuture, Connection, ConnectionInfo, ConnectionManager, Direction};
pub use error::{Error, Result};
pub use frame::{Frame, OpCode};
pub use negotiate::HandshakeState;
pub use server::{BindAddress, ListenerState, ServerConfig, ServerConfigBuilder, WsServer};
pub use stream::{Channel, ChannelCloser, WsChannel, WsStream};
pub use transport::{TcpConnector, WebSocketTransport};

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Small message threshold (< 126 bytes uses a 2-byte header)
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Medium message threshold (< 64KB uses a 4-byte header)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default receive buffer size
pub const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// Default write buffer size
pub const WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Default maximum size of an HTTP header section during the upgrade
pub const MAX_HEADER_SIZE: usize = 8192;

// ============================================================================
// Stream configuration
// ============================================================================

/// Per-connection configuration shared by the dialer and the listener
///
/// # Example
///
/// ```
/// use sockudo_p2p_ws::Config;
///
/// let config = Config::builder()
///     .max_frame_size(1024 * 1024)
///     .high_water_mark(128 * 1024)
///     .tcp_nodelay(false)
///     .build();
/// assert_eq!(config.max_frame_size, 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum accepted frame payload, also the largest frame written (default: 16MB)
    pub max_frame_size: usize,
    /// Maximum HTTP header section accepted during the upgrade (default: 8KB)
    pub max_header_size: usize,
    /// Initial write buffer capacity (default: 16KB)
    pub write_buffer_size: usize,
    /// Buffered outbound bytes that pause writers (default: 64KB)
    pub high_water_mark: usize,
    /// Buffered outbound bytes at which paused writers resume (default: 16KB)
    pub low_water_mark: usize,
    /// Set SO_REUSEADDR on dialing sockets (default: true)
    pub reuse_address: bool,
    /// Set TCP_NODELAY on dialed sockets (default: true)
    pub tcp_nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_header_size: MAX_HEADER_SIZE,
            write_buffer_size: WRITE_BUFFER_SIZE,
            high_water_mark: 64 * 1024,
            low_water_mark: 16 * 1024,
            reuse_address: true,
            tcp_nodelay: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set maximum HTTP header section size
    pub fn max_header_size(mut self, size: usize) -> Self {
        self.config.max_header_size = size;
        self
    }

    /// Set initial write buffer capacity
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set the high water mark for outbound backpressure
    pub fn high_water_mark(mut self, size: usize) -> Self {
        self.config.high_water_mark = size;
        self
    }

    /// Set the low water mark for outbound backpressure
    pub fn low_water_mark(mut self, size: usize) -> Self {
        self.config.low_water_mark = size;
        self
    }

    /// Enable or disable SO_REUSEADDR on dialing sockets
    pub fn reuse_address(mut self, enabled: bool) -> Self {
        self.config.reuse_address = enabled;
        self
    }

    /// Enable or disable TCP_NODELAY on dialed sockets
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    /// Build the configuration
    ///
    /// The low water mark is clamped so it never exceeds the high water mark.
    pub fn build(mut self) -> Config {
        if self.config.low_water_mark > self.config.high_water_mark {
            self.config.low_water_mark = self.config.high_water_mark;
        }
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::codec::{FrameCodec, Role};
    pub use crate::connection::{Connection, ConnectionInfo, ConnectionManager, Direction};
    pub use crate::error::{Error, Result};
    pub use crate::server::{BindAddress, ServerConfig, WsServer};
    pub use crate::stream::WsChannel;
    pub use crate::transport::WebSocketTransport;
}
