//! End-to-end NAT discovery scenarios against a scripted STUN server.
//!
//! Each scenario runs the full probe sequence over loopback UDP: a primary
//! socket plays the original server and a second socket plays the
//! CHANGED-ADDRESS endpoint. The script controls which probes are answered
//! and which mapped address each endpoint reports, reproducing the probe
//! outcomes of every classification in the RFC 3489 decision tree.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use natprobe::codec::{AttrType, Host, Message, MessageType};
use natprobe::{ClientConfig, Discovery, DiscoveryConfig, NatType};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Which probes the server answers, and what it claims to see.
#[derive(Debug, Clone, Copy)]
struct Script {
    respond_test_i: bool,
    respond_test_ii: bool,
    respond_test_iii: bool,
    /// Mapped address reported by the primary endpoint;
    /// `None` echoes the request's actual source address.
    primary_mapped: Option<SocketAddr>,
    /// Mapped address reported by the alternate endpoint.
    alternate_mapped: Option<SocketAddr>,
    /// Whether responses carry a CHANGED-ADDRESS attribute.
    advertise_changed: bool,
}

impl Default for Script {
    fn default() -> Self {
        Script {
            respond_test_i: true,
            respond_test_ii: true,
            respond_test_iii: true,
            primary_mapped: None,
            alternate_mapped: None,
            advertise_changed: true,
        }
    }
}

/// The three RFC 3489 probe kinds, recovered from CHANGE-REQUEST flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TestKind {
    I,
    II,
    III,
}

fn classify_request(message: &Message) -> TestKind {
    match message.get(AttrType::CHANGE_REQUEST) {
        Some(value) if value.len() == 4 && value[3] & 0x04 != 0 => TestKind::II,
        Some(value) if value.len() == 4 && value[3] & 0x02 != 0 => TestKind::III,
        _ => TestKind::I,
    }
}

fn binding_response(
    request: &Message,
    mapped: SocketAddr,
    changed: Option<SocketAddr>,
) -> Message {
    let mut response = Message::new(MessageType::BINDING_SUCCESS);
    response.set_transaction_id(request.transaction_id);
    let seed = response.xor_seed();
    response.add(
        AttrType::XOR_MAPPED_ADDRESS,
        &Host::from(mapped).xor_mapped_value(&seed),
    );
    response.add(AttrType::MAPPED_ADDRESS, &Host::from(mapped).mapped_value());
    if let Some(changed) = changed {
        response.add(AttrType::CHANGED_ADDRESS, &Host::from(changed).mapped_value());
    }
    response.add_software("natprobe-scripted-server");
    response
}

async fn serve_socket(
    socket: Arc<UdpSocket>,
    script: Script,
    mapped_override: Option<SocketAddr>,
    changed: Option<SocketAddr>,
) {
    let mut buf = [0u8; 1024];
    while let Ok((len, from)) = socket.recv_from(&mut buf).await {
        let Ok(request) = Message::decode(&buf[..len]) else {
            continue;
        };
        let answer = match classify_request(&request) {
            TestKind::I => script.respond_test_i,
            TestKind::II => script.respond_test_ii,
            TestKind::III => script.respond_test_iii,
        };
        if !answer {
            continue;
        }
        let mapped = mapped_override.unwrap_or(from);
        let response = binding_response(&request, mapped, changed);
        let _ = socket.send_to(response.as_bytes(), from).await;
    }
}

/// Binds the two server endpoints and spawns their serve loops; returns
/// the primary endpoint's address.
async fn spawn_scripted_server(script: Script) -> SocketAddr {
    let primary = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let alternate = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let primary_addr = primary.local_addr().unwrap();
    let alternate_addr = alternate.local_addr().unwrap();

    let changed = script.advertise_changed.then_some(alternate_addr);
    tokio::spawn(serve_socket(
        Arc::clone(&primary),
        script,
        script.primary_mapped,
        changed,
    ));
    tokio::spawn(serve_socket(
        alternate,
        script,
        script.alternate_mapped,
        changed,
    ));
    primary_addr
}

async fn run_scenario(script: Script) -> (NatType, Option<Host>, SocketAddr) {
    init_tracing();
    let server = spawn_scripted_server(script).await;
    let config = DiscoveryConfig {
        server: server.to_string(),
        software_name: "natprobe-tests".to_string(),
        probe_timeout: Duration::from_millis(250),
        client: ClientConfig {
            collector_interval: Duration::from_millis(25),
        },
    };
    let mut discovery = Discovery::connect(config).await.unwrap();
    let local = discovery.local_addr();
    let nat_type = discovery.discover().await.unwrap();
    assert_eq!(discovery.nat_type(), nat_type);
    let mapped = discovery.mapped_address();
    discovery.close().await.unwrap();
    (nat_type, mapped, local)
}

#[tokio::test]
async fn open_internet_host_is_not_behind_a_nat() {
    // Test I echoes the true source address, Test II is answered.
    let (nat_type, mapped, local) = run_scenario(Script::default()).await;
    assert_eq!(nat_type, NatType::None);
    let mapped = mapped.unwrap();
    assert_eq!(mapped.ip(), local.ip());
    assert_eq!(mapped.port(), local.port());
}

#[tokio::test]
async fn unanswered_change_request_behind_own_address_is_a_firewall() {
    // The mapped address is our own, but the alternate endpoint's probe
    // never gets through.
    let script = Script {
        respond_test_ii: false,
        ..Script::default()
    };
    let (nat_type, _, _) = run_scenario(script).await;
    assert_eq!(nat_type, NatType::SymmetricUdpFirewall);
}

#[tokio::test]
async fn translated_address_with_open_filtering_is_full_cone() {
    let external: SocketAddr = "203.0.113.9:4242".parse().unwrap();
    let script = Script {
        primary_mapped: Some(external),
        alternate_mapped: Some(external),
        ..Script::default()
    };
    let (nat_type, mapped, _) = run_scenario(script).await;
    assert_eq!(nat_type, NatType::FullCone);
    assert_eq!(mapped.unwrap().socket_addr(), external);
}

#[tokio::test]
async fn per_destination_mappings_are_symmetric() {
    // The alternate endpoint observes a different external port.
    let script = Script {
        respond_test_ii: false,
        primary_mapped: Some("203.0.113.9:4000".parse().unwrap()),
        alternate_mapped: Some("203.0.113.9:4001".parse().unwrap()),
        ..Script::default()
    };
    let (nat_type, mapped, _) = run_scenario(script).await;
    assert_eq!(nat_type, NatType::Symmetric);
    // The recorded mapped address is the one seen under the original server.
    assert_eq!(mapped.unwrap().port(), 4000);
}

#[tokio::test]
async fn stable_mapping_with_answered_port_change_is_restricted() {
    let external: SocketAddr = "203.0.113.9:4000".parse().unwrap();
    let script = Script {
        respond_test_ii: false,
        primary_mapped: Some(external),
        alternate_mapped: Some(external),
        ..Script::default()
    };
    let (nat_type, _, _) = run_scenario(script).await;
    assert_eq!(nat_type, NatType::Restricted);
}

#[tokio::test]
async fn stable_mapping_with_unanswered_port_change_is_port_restricted() {
    let external: SocketAddr = "203.0.113.9:4000".parse().unwrap();
    let script = Script {
        respond_test_ii: false,
        respond_test_iii: false,
        primary_mapped: Some(external),
        alternate_mapped: Some(external),
        ..Script::default()
    };
    let (nat_type, _, _) = run_scenario(script).await;
    assert_eq!(nat_type, NatType::PortRestricted);
}

#[tokio::test]
async fn silent_server_means_udp_is_blocked() {
    let script = Script {
        respond_test_i: false,
        respond_test_ii: false,
        respond_test_iii: false,
        ..Script::default()
    };
    let (nat_type, mapped, _) = run_scenario(script).await;
    assert_eq!(nat_type, NatType::UdpBlocked);
    assert_eq!(mapped, None);
}

#[tokio::test]
async fn missing_alternate_endpoint_is_not_classifiable() {
    // A response with no CHANGED-ADDRESS or OTHER-ADDRESS leaves the
    // decision tree without a second endpoint to probe.
    let script = Script {
        advertise_changed: false,
        ..Script::default()
    };
    let (nat_type, mapped, _) = run_scenario(script).await;
    assert_eq!(nat_type, NatType::Error);
    // The mapped address from Test I is still reported.
    assert!(mapped.is_some());
}
