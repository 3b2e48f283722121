//! Post-upgrade byte streams
//!
//! - [`Channel`] type-erases the raw socket (TCP or Unix) under the codec
//! - [`WsStream`] frames writes and unframes reads, so the connection above
//!   sees a plain `AsyncRead + AsyncWrite` byte stream
//!
//! ```ignore
//! let channel = Channel::new(tcp_stream);
//! let ws: WsChannel = WsStream::new(channel, Role::Initiator, &Config::default());
//! ```

mod channel;
mod websocket;

pub use channel::{Channel, ChannelCloser};
pub use websocket::WsStream;

/// Byte stream handed to [`Connection::initialize_channel`](crate::Connection::initialize_channel)
pub type WsChannel = WsStream<Channel>;
