//! Network endpoint type.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// A network endpoint (IP address + port).
///
/// Wrapper around [`SocketAddr`] that keeps the rest of the crate independent
/// of the socket backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Creates a new endpoint from an IP address and port.
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    /// Creates a new IPv4 endpoint.
    #[must_use]
    pub const fn new_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, d),
            port,
        )))
    }

    /// Creates a localhost endpoint on the given port.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new_v4(127, 0, 0, 1, port)
    }

    /// Returns the IP address.
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    /// Whether the address is a multicast group address.
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.0.ip().is_multicast()
    }

    /// Returns the underlying [`SocketAddr`].
    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddr::from_str(s).map(Self)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
