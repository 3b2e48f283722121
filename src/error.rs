//! Error types for the WebSocket transport

use std::io;
use std::time::Duration;

use bytes::Bytes;
use multiaddr::Multiaddr;

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    /// Invalid WebSocket frame
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    /// Protocol violation
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Frame payload exceeds the configured limit
    #[error("frame too large")]
    FrameTooLarge,
    /// Connection closed
    #[error("connection closed")]
    ConnectionClosed,
    /// Connection reset by peer
    #[error("connection reset by peer")]
    ConnectionReset,
    /// Malformed HTTP during the upgrade
    #[error("invalid HTTP: {0}")]
    InvalidHttp(&'static str),
    /// Upgrade completed with an unusable response or request
    #[error("handshake failed: {0}")]
    HandshakeFailed(&'static str),
    /// Server answered the upgrade request with something other than 101
    #[error("upgrade rejected with HTTP status {status}")]
    UpgradeRejected {
        /// Response status code
        status: u16,
        /// Response body, kept for diagnostics
        body: Bytes,
    },
    /// Address lacks an IPv4 TCP component or the ws marker
    #[error("cannot dial {0} over websockets")]
    InvalidMultiaddr(Multiaddr),
    /// Peer address that cannot be expressed as a multiaddr
    #[error("remote address {0} cannot be expressed as a multiaddr")]
    InvalidRemoteAddress(String),
    /// Operation not provided by this component
    #[error("{0} is not implemented")]
    NotYetImplemented(&'static str),
    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Listener shutdown exceeded its timeout; remaining connections were force-closed
    #[error("listener stop took longer than {0:?}")]
    ShutdownTimedOut(Duration),
}

impl Error {
    /// Whether this error means the peer is gone rather than misbehaving
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::ConnectionReset)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::ConnectionReset => {
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")
            }
            Error::ConnectionClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
            }
            e @ (Error::InvalidFrame(_) | Error::Protocol(_) | Error::FrameTooLarge) => {
                io::Error::new(io::ErrorKind::InvalidData, e)
            }
            other => io::Error::other(other),
        }
    }
}
