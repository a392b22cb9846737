//! Parsed transport addresses as carried in STUN address attributes.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// STUN address family codes (RFC 5389 Section 15.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    /// IPv4, wire code 0x01.
    V4,
    /// IPv6, wire code 0x02.
    V6,
}

impl AddressFamily {
    /// Returns the one-byte wire code for this family.
    pub fn code(self) -> u8 {
        match self {
            AddressFamily::V4 => 0x01,
            AddressFamily::V6 => 0x02,
        }
    }

    /// Maps a wire code back to a family, if recognized.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(AddressFamily::V4),
            0x02 => Some(AddressFamily::V6),
            _ => None,
        }
    }
}

/// A transport address decoded from (or encodable into) a STUN address
/// attribute: family, IP, and 16-bit port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    ip: IpAddr,
    port: u16,
}

impl Host {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Host { ip, port }
    }

    /// The address family, derived from the IP version.
    pub fn family(&self) -> AddressFamily {
        match self.ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The address as a socket address, suitable for rebinding a client.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Host {
    fn from(addr: SocketAddr) -> Self {
        Host::new(addr.ip(), addr.port())
    }
}

impl FromStr for Host {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddr::from_str(s).map(Host::from)
    }
}

impl fmt::Display for Host {
    /// Renders as `ip:port`, with the IPv6 form bracketed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}
