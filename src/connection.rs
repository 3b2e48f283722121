//! External connection collaborators
//!
//! The transport never owns a connection. It asks a [`ConnectionManager`] to
//! create one when a socket appears, registers it, and once the upgrade
//! completes hands it the framed byte stream through
//! [`Connection::initialize_channel`]. Security and multiplexing run above
//! that stream and never see WebSocket framing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use multiaddr::{Multiaddr, PeerId};

use crate::error::{Error, Result};
use crate::stream::WsChannel;

/// Boxed future returned by the collaborator traits
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Accepted by a listener
    Inbound,
    /// Dialed by this node
    Outbound,
}

/// Metadata the manager receives when a connection is created
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Inbound or outbound
    pub direction: Direction,
    /// Remote address, always carrying the `ws` marker
    pub remote_addr: Multiaddr,
    /// Identity the remote is expected to prove, when the dialed address named one
    pub expected_peer: Option<PeerId>,
}

/// A connection created by the host's [`ConnectionManager`]
pub trait Connection: Send + Sync + 'static {
    /// Run the connection's own protocol stack over the upgraded stream.
    ///
    /// Called exactly once, after the 101 exchange. The returned future
    /// should resolve once the stack is installed; the stream itself may be
    /// moved into a task that outlives it.
    fn initialize_channel(&self, channel: WsChannel) -> BoxFuture<'_, Result<()>>;

    /// The channel became active: first data arrived or initialization finished
    fn channel_active(&self) {}

    /// The socket closed before an upgrade happened.
    fn closed_before_upgrade(&self, _error: &Error) {}

    /// Span the connection's setup is logged under
    fn span(&self) -> tracing::Span {
        tracing::Span::current()
    }
}

/// Creates and tracks connections for the transport
pub trait ConnectionManager: Send + Sync + 'static {
    /// Connection type this manager produces
    type Connection: Connection;

    /// Create a connection for a socket that was just connected or accepted
    fn generate_connection(&self, info: ConnectionInfo) -> Arc<Self::Connection>;

    /// Register a connection; may run concurrently with its handshake
    fn add_connection(&self, connection: Arc<Self::Connection>) -> BoxFuture<'_, Result<()>>;
}
