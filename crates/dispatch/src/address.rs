use std::net::{IpAddr, SocketAddr};

/// Address family of a peer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Ipv4,
    Ipv6,
}

/// Canonical peer endpoint.
///
/// Wraps the address reported by the socket layer and fixes the byte encoding
/// used wherever the address must be bound under a MAC, so that the same peer
/// always serializes the same way regardless of how the socket layer spelled
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(SocketAddr);

impl Address {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn family(&self) -> Family {
        match self.0.ip() {
            IpAddr::V4(_) => Family::Ipv4,
            IpAddr::V6(_) => Family::Ipv6,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// The raw form expected by the socket layer.
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Family-tagged `{tag, ip octets, port}` encoding.
    ///
    /// # Test
    ///
    /// ```
    /// use webtransport_server_dispatch::address::Address;
    ///
    /// let addr = Address::new("192.0.2.1:4433".parse().unwrap());
    ///
    /// assert_eq!(
    ///     addr.to_canonical_bytes(),
    ///     vec![4, 192, 0, 2, 1, 0x11, 0x51]
    /// );
    /// ```
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(19);

        match self.0.ip() {
            IpAddr::V4(ip) => {
                bytes.push(4);
                bytes.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                bytes.push(6);
                bytes.extend_from_slice(&ip.octets());
            }
        }

        bytes.extend_from_slice(&self.0.port().to_be_bytes());
        bytes
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
