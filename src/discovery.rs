//! RFC 3489 NAT type discovery.
//!
//! Classifies the client's network position by probing a STUN server with
//! three binding requests and observing which responses arrive and which
//! mapped addresses they carry:
//!
//! - Test I: plain binding request.
//! - Test II: binding request with CHANGE-REQUEST = change IP | change port.
//! - Test III: binding request with CHANGE-REQUEST = change port only.
//!
//! ```text
//!                     +--------+
//!                     |  Test  |
//!                     |   I    |
//!                     +--------+
//!                          |
//!                          V
//!                         /\              /\
//!                      N /  \ Y          /  \ Y             +--------+
//!       UDP     <-------/Resp\--------->/ IP \------------->|  Test  |
//!       Blocked         \ ?  /          \Same/              |   II   |
//!                        \  /            \? /               +--------+
//!                         \/              \/                    |
//!                                          | N                  V
//!                                          V                    /\
//!                                      +--------+  Sym.      N /  \
//!                                      |  Test  |  UDP    <---/Resp\
//!                                      |   II   |  Firewall   \ ?  /
//!                                      +--------+              \  /
//!                                          |                    \/
//!                                          V                     |Y
//!               /\                         /\                    V
//!    Symmetric N/  \       +--------+   N /  \                 Open
//!       NAT <--/ IP \<-----|  Test  |<---/Resp\                Internet
//!              \Same/      |   I    |    \ ?  /
//!               \? /       +--------+     \  /
//!                \/                        \/
//!                |Y                         |Y
//!                |                          V
//!                V                          Full Cone
//!            +--------+        /\
//!            |  Test  |       /  \ Y
//!            |   III  |----->/Resp\----> Restricted
//!            +--------+      \ ?  /
//!                             \  /
//!                              \/
//!                               |N
//!                               +-------> Port Restricted
//! ```
//!
//! The original RFC 3489 flow is callback-chained; here each probe is
//! simply awaited in sequence, which is behaviorally identical.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::{debug, warn};

use crate::agent::Event;
use crate::client::{Client, ClientConfig};
use crate::codec::{Host, Message, MessageType};
use crate::error::Error;

/// NAT classification produced by [`Discovery::discover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// The probe sequence failed before a classification was possible.
    Error,
    /// The server responded in a way the decision tree cannot classify.
    Unknown,
    /// No NAT between the client and the server.
    None,
    /// No UDP connectivity to the server at all.
    UdpBlocked,
    /// The external mapping accepts packets from any source.
    FullCone,
    /// A new mapping is allocated per destination.
    Symmetric,
    /// Inbound packets are filtered by source IP.
    Restricted,
    /// Inbound packets are filtered by source IP and port.
    PortRestricted,
    /// No NAT, but a firewall drops unsolicited inbound UDP.
    SymmetricUdpFirewall,
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NatType::Error => "Test failed",
            NatType::Unknown => "Unexpected response from the STUN server",
            NatType::None => "Not behind a NAT",
            NatType::UdpBlocked => "UDP is blocked",
            NatType::FullCone => "Full cone NAT",
            NatType::Symmetric => "Symmetric NAT",
            NatType::Restricted => "Restricted NAT",
            NatType::PortRestricted => "Port restricted NAT",
            NatType::SymmetricUdpFirewall => "Symmetric UDP firewall",
        })
    }
}

/// Discovery configuration.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// STUN server as a `host:port` string.
    pub server: String,
    /// Value of the SOFTWARE attribute sent with each probe.
    pub software_name: String,
    /// Per-probe deadline (serialized as milliseconds).
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_timeout: Duration,
    /// Tuning for the underlying client.
    pub client: ClientConfig,
}

impl DiscoveryConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            server: "stun.l.google.com:19302".to_string(),
            software_name: concat!("natprobe/", env!("CARGO_PKG_VERSION")).to_string(),
            probe_timeout: Duration::from_secs(3),
            client: ClientConfig::default(),
        }
    }
}

/// NAT discovery session over an owned [`Client`].
pub struct Discovery {
    client: Client,
    server_addr: SocketAddr,
    software_name: String,
    probe_timeout: Duration,
    local_addr: SocketAddr,
    mapped_addr: Option<Host>,
    nat_type: NatType,
}

impl Discovery {
    /// Resolves the configured server, binds a client against it, and
    /// records the socket's effective local address.
    pub async fn connect(config: DiscoveryConfig) -> Result<Discovery, Error> {
        let server_addr = tokio::net::lookup_host(config.server.as_str())
            .await?
            .next()
            .ok_or_else(|| Error::Io(format!("{} resolved to no addresses", config.server)))?;
        let client = Client::connect(server_addr, config.client).await?;

        // The socket binds to the unspecified address, so substitute the
        // IP the host routes toward the server while keeping the bound
        // ephemeral port.
        let socket_addr = client.local_addr()?;
        let local_addr = match route_local_ip(server_addr) {
            Some(ip) => SocketAddr::new(ip, socket_addr.port()),
            None => socket_addr,
        };
        debug!("local address for identity checks: {}", local_addr);

        Ok(Discovery {
            client,
            server_addr,
            software_name: config.software_name,
            probe_timeout: config.probe_timeout,
            local_addr,
            mapped_addr: None,
            nat_type: NatType::Error,
        })
    }

    /// The classification from the most recent [`Discovery::discover`] run.
    pub fn nat_type(&self) -> NatType {
        self.nat_type
    }

    /// The mapped address last observed under the original server.
    pub fn mapped_address(&self) -> Option<Host> {
        self.mapped_addr
    }

    /// The local address used for the identical-address comparison.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tears down the owned client.
    pub async fn close(self) -> Result<(), Error> {
        self.client.close().await
    }

    fn binding_request(&self, change_ip: bool, change_port: bool) -> Message {
        let mut m = Message::new(MessageType::BINDING_REQUEST);
        m.new_transaction_id();
        m.add_software(&self.software_name);
        if change_ip || change_port {
            m.add_change_request(change_ip, change_port);
        }
        m.add_fingerprint();
        m
    }

    async fn probe(&self, change_ip: bool, change_port: bool) -> Event {
        let request = self.binding_request(change_ip, change_port);
        let deadline = Instant::now() + self.probe_timeout;
        self.client.request(&request, deadline).await
    }

    async fn test_i(&self) -> Event {
        self.probe(false, false).await
    }

    async fn test_ii(&self) -> Event {
        self.probe(true, true).await
    }

    async fn test_iii(&self) -> Event {
        self.probe(false, true).await
    }

    /// Runs the probe sequence and classifies the NAT.
    ///
    /// Only a probe timeout counts as "no response"; any other transport
    /// error aborts the procedure, leaving the classification at whatever
    /// was last assigned.
    pub async fn discover(&mut self) -> Result<NatType, Error> {
        self.nat_type = NatType::Error;
        self.mapped_addr = None;
        self.client.change_server_address(self.server_addr);

        debug!("sending test I to {}", self.server_addr);
        let first = match self.test_i().await {
            Ok(message) => message,
            Err(Error::Timeout) => {
                self.nat_type = NatType::UdpBlocked;
                return Ok(self.nat_type);
            }
            Err(err) => {
                warn!("test I failed: {}", err);
                return Err(err);
            }
        };

        let info = first.address_info();
        let Some(mapped) = info.mapped else {
            warn!("test I response carried no mapped address");
            return Ok(self.nat_type);
        };
        debug!("mapped address: {}", mapped);
        self.mapped_addr = Some(mapped);
        let identical = is_local_address(self.local_addr, mapped.ip());

        let Some(alternate) = info.alternate() else {
            warn!("test I response carried no changed or other address");
            return Ok(self.nat_type);
        };
        debug!("alternate server endpoint: {}", alternate);

        debug!("sending test II to {}", self.server_addr);
        match self.test_ii().await {
            Ok(_) => {
                self.nat_type = if identical {
                    NatType::None
                } else {
                    NatType::FullCone
                };
                return Ok(self.nat_type);
            }
            Err(Error::Timeout) if identical => {
                self.nat_type = NatType::SymmetricUdpFirewall;
                return Ok(self.nat_type);
            }
            Err(Error::Timeout) => {}
            Err(err) => {
                warn!("test II failed: {}", err);
                return Err(err);
            }
        }

        // Same socket, different server endpoint: does the NAT hand out
        // the same external mapping?
        self.client.change_server_address(alternate.socket_addr());
        debug!("sending test I to {}", alternate);
        let second = match self.test_i().await {
            Ok(message) => message,
            Err(Error::Timeout) => {
                self.nat_type = NatType::Unknown;
                return Ok(self.nat_type);
            }
            Err(err) => {
                warn!("test I toward the alternate endpoint failed: {}", err);
                return Err(err);
            }
        };
        let Some(remapped) = second.address_info().mapped else {
            self.nat_type = NatType::Unknown;
            return Ok(self.nat_type);
        };
        debug!("mapped address via alternate endpoint: {}", remapped);

        if mapped.ip() != remapped.ip() || mapped.port() != remapped.port() {
            self.nat_type = NatType::Symmetric;
            return Ok(self.nat_type);
        }

        debug!("sending test III to {}", alternate);
        match self.test_iii().await {
            Ok(_) => self.nat_type = NatType::Restricted,
            Err(Error::Timeout) => self.nat_type = NatType::PortRestricted,
            Err(err) => {
                warn!("test III failed: {}", err);
                return Err(err);
            }
        }
        Ok(self.nat_type)
    }
}

/// Reports whether the mapped IP the server observed belongs to this host.
///
/// If the local IP is specified, compare it directly; otherwise fall back
/// to the host's candidate interface addresses. Ports are never compared:
/// the question is whether the *address* survived translation.
pub(crate) fn is_local_address(local: SocketAddr, mapped_ip: IpAddr) -> bool {
    if !local.ip().is_unspecified() {
        return local.ip() == mapped_ip;
    }
    interface_candidate_ips().into_iter().any(|ip| ip == mapped_ip)
}

/// The source IP the host would use to reach `server`, learned from a
/// connected (but never written to) UDP socket.
fn route_local_ip(server: SocketAddr) -> Option<IpAddr> {
    let bind: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = std::net::UdpSocket::bind(bind).ok()?;
    socket.connect(server).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Candidate local IPs for the unspecified-address fallback: the default
/// outbound route for each family, plus the loopbacks.
fn interface_candidate_ips() -> Vec<IpAddr> {
    let probes: [SocketAddr; 2] = [
        (Ipv4Addr::new(8, 8, 8, 8), 80).into(),
        (Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888), 80).into(),
    ];
    let mut ips = Vec::new();
    for server in probes {
        if let Some(ip) = route_local_ip(server) {
            if !ip.is_unspecified() {
                ips.push(ip);
            }
        }
    }
    ips.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    ips.push(IpAddr::V6(Ipv6Addr::LOCALHOST));
    ips
}
