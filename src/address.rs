//! Multiaddr capability checks
//!
//! The transport dials `/ip4/<addr>/tcp/<port>/ws`, optionally followed by
//! `/p2p/<peer>`. IPv6, DNS and secure WebSocket addresses are refused
//! outright so the caller can try another transport.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::path::Path;

use multiaddr::{Multiaddr, PeerId, Protocol};

use crate::error::{Error, Result};

/// Dialable endpoint extracted from a multiaddr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpTarget {
    /// IPv4 socket address to connect to
    pub addr: SocketAddrV4,
    /// Peer named by a trailing `/p2p/<id>` component
    pub expected_peer: Option<PeerId>,
}

impl TcpTarget {
    /// Extract the TCP endpoint; fails unless the address is dialable.
    pub fn from_multiaddr(addr: &Multiaddr) -> Result<Self> {
        let mut ip = None;
        let mut port = None;
        let mut ws = false;
        let mut expected_peer = None;

        for proto in addr.iter() {
            match proto {
                Protocol::Ip4(a) if ip.is_none() => ip = Some(a),
                Protocol::Tcp(p) if port.is_none() => port = Some(p),
                Protocol::Ws(_) => ws = true,
                Protocol::P2p(peer) => expected_peer = Some(peer),
                // secure websockets are not supported
                Protocol::Wss(_) | Protocol::Tls => {
                    return Err(Error::InvalidMultiaddr(addr.clone()));
                }
                _ => {}
            }
        }

        match (ip, port, ws) {
            (Some(ip), Some(port), true) => Ok(Self {
                addr: SocketAddrV4::new(ip, port),
                expected_peer,
            }),
            _ => Err(Error::InvalidMultiaddr(addr.clone())),
        }
    }

    /// Value of the `Host` header for this target
    pub fn host_header(&self) -> String {
        self.addr.to_string()
    }
}

/// Whether the transport can dial `addr`
pub fn is_dialable(addr: &Multiaddr) -> bool {
    TcpTarget::from_multiaddr(addr).is_ok()
}

/// Whether `addr` carries the plain `ws` marker
pub fn has_ws_marker(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::Ws(_)))
}

/// `/ip4|ip6/<ip>/tcp/<port>/ws` for a connected or bound socket
pub fn socket_to_multiaddr(addr: SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => Protocol::Ip4(ip),
        IpAddr::V6(ip) => Protocol::Ip6(ip),
    };
    Multiaddr::empty()
        .with(ip)
        .with(Protocol::Tcp(addr.port()))
        .with(Protocol::Ws(Cow::Borrowed("/")))
}

/// `/ip4/<host>/tcp/<port>/ws`, or `/dns/<host>/...` when `host` is a name
pub fn host_to_multiaddr(host: &str, port: u16) -> Multiaddr {
    let network = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Protocol::Ip4(ip),
        Ok(IpAddr::V6(ip)) => Protocol::Ip6(ip),
        Err(_) => Protocol::Dns(Cow::Owned(host.to_string())),
    };
    Multiaddr::empty()
        .with(network)
        .with(Protocol::Tcp(port))
        .with(Protocol::Ws(Cow::Borrowed("/")))
}

/// `/unix/<path>/ws` for a filesystem socket
pub fn unix_to_multiaddr(path: &Path) -> Result<Multiaddr> {
    let path = path
        .to_str()
        .ok_or_else(|| Error::InvalidRemoteAddress(path.display().to_string()))?;
    Ok(Multiaddr::empty()
        .with(Protocol::Unix(Cow::Owned(path.to_string())))
        .with(Protocol::Ws(Cow::Borrowed("/"))))
}
