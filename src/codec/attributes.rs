//! STUN attribute types and value codecs.
//!
//! Each attribute is a TLV: 2-byte type, 2-byte unpadded value length, value
//! bytes, then zero padding to the next 4-byte boundary. Address attributes
//! follow the layout of RFC 5389 Section 15.1 (one reserved byte, one family
//! byte, 2-byte port, 4- or 16-byte address), with the XOR variants masked
//! against the magic cookie and transaction ID.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder};

use super::host::{AddressFamily, Host};
use super::message::Message;
use super::FINGERPRINT_XOR;

/// A 16-bit STUN attribute type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttrType(u16);

/// Attributes from the comprehension-required range (0x0000-0x7FFF).
impl AttrType {
    pub const MAPPED_ADDRESS: AttrType = AttrType(0x0001);
    pub const RESPONSE_ADDRESS: AttrType = AttrType(0x0002);
    pub const CHANGE_REQUEST: AttrType = AttrType(0x0003);
    pub const SOURCE_ADDRESS: AttrType = AttrType(0x0004);
    pub const CHANGED_ADDRESS: AttrType = AttrType(0x0005);
    pub const USERNAME: AttrType = AttrType(0x0006);
    pub const MESSAGE_INTEGRITY: AttrType = AttrType(0x0008);
    pub const ERROR_CODE: AttrType = AttrType(0x0009);
    pub const UNKNOWN_ATTRIBUTES: AttrType = AttrType(0x000A);
    pub const CHANNEL_NUMBER: AttrType = AttrType(0x000C);
    pub const LIFETIME: AttrType = AttrType(0x000D);
    pub const XOR_PEER_ADDRESS: AttrType = AttrType(0x0012);
    pub const DATA: AttrType = AttrType(0x0013);
    pub const REALM: AttrType = AttrType(0x0014);
    pub const NONCE: AttrType = AttrType(0x0015);
    pub const XOR_RELAYED_ADDRESS: AttrType = AttrType(0x0016);
    pub const EVEN_PORT: AttrType = AttrType(0x0018);
    pub const REQUESTED_TRANSPORT: AttrType = AttrType(0x0019);
    pub const DONT_FRAGMENT: AttrType = AttrType(0x001A);
    pub const XOR_MAPPED_ADDRESS: AttrType = AttrType(0x0020);
    pub const RESERVATION_TOKEN: AttrType = AttrType(0x0022);
    pub const PRIORITY: AttrType = AttrType(0x0024);
    pub const USE_CANDIDATE: AttrType = AttrType(0x0025);
}

/// Attributes from the comprehension-optional range (0x8000-0xFFFF).
impl AttrType {
    /// Pre-standard alias some servers use for XOR-MAPPED-ADDRESS.
    pub const XOR_MAPPED_ADDRESS_EXP: AttrType = AttrType(0x8020);
    pub const SOFTWARE: AttrType = AttrType(0x8022);
    pub const ALTERNATE_SERVER: AttrType = AttrType(0x8023);
    pub const FINGERPRINT: AttrType = AttrType(0x8028);
    pub const ICE_CONTROLLED: AttrType = AttrType(0x8029);
    pub const ICE_CONTROLLING: AttrType = AttrType(0x802A);
    pub const RESPONSE_ORIGIN: AttrType = AttrType(0x802B);
    /// RFC 5780 replacement for CHANGED-ADDRESS.
    pub const OTHER_ADDRESS: AttrType = AttrType(0x802C);
}

impl AttrType {
    pub const fn new(value: u16) -> Self {
        AttrType(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            AttrType::MAPPED_ADDRESS => "MAPPED-ADDRESS",
            AttrType::RESPONSE_ADDRESS => "RESPONSE-ADDRESS",
            AttrType::CHANGE_REQUEST => "CHANGE-REQUEST",
            AttrType::SOURCE_ADDRESS => "SOURCE-ADDRESS",
            AttrType::CHANGED_ADDRESS => "CHANGED-ADDRESS",
            AttrType::USERNAME => "USERNAME",
            AttrType::MESSAGE_INTEGRITY => "MESSAGE-INTEGRITY",
            AttrType::ERROR_CODE => "ERROR-CODE",
            AttrType::UNKNOWN_ATTRIBUTES => "UNKNOWN-ATTRIBUTES",
            AttrType::CHANNEL_NUMBER => "CHANNEL-NUMBER",
            AttrType::LIFETIME => "LIFETIME",
            AttrType::XOR_PEER_ADDRESS => "XOR-PEER-ADDRESS",
            AttrType::DATA => "DATA",
            AttrType::REALM => "REALM",
            AttrType::NONCE => "NONCE",
            AttrType::XOR_RELAYED_ADDRESS => "XOR-RELAYED-ADDRESS",
            AttrType::EVEN_PORT => "EVEN-PORT",
            AttrType::REQUESTED_TRANSPORT => "REQUESTED-TRANSPORT",
            AttrType::DONT_FRAGMENT => "DONT-FRAGMENT",
            AttrType::XOR_MAPPED_ADDRESS => "XOR-MAPPED-ADDRESS",
            AttrType::RESERVATION_TOKEN => "RESERVATION-TOKEN",
            AttrType::PRIORITY => "PRIORITY",
            AttrType::USE_CANDIDATE => "USE-CANDIDATE",
            AttrType::XOR_MAPPED_ADDRESS_EXP => "XOR-MAPPED-ADDRESS-EXP",
            AttrType::SOFTWARE => "SOFTWARE",
            AttrType::ALTERNATE_SERVER => "ALTERNATE-SERVER",
            AttrType::FINGERPRINT => "FINGERPRINT",
            AttrType::ICE_CONTROLLED => "ICE-CONTROLLED",
            AttrType::ICE_CONTROLLING => "ICE-CONTROLLING",
            AttrType::RESPONSE_ORIGIN => "RESPONSE-ORIGIN",
            AttrType::OTHER_ADDRESS => "OTHER-ADDRESS",
            AttrType(other) => return write!(f, "0x{other:04x}"),
        };
        f.write_str(name)
    }
}

/// A decoded (or to-be-encoded) attribute: type, unpadded length, value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub typ: AttrType,
    /// Declared value length, excluding padding.
    pub length: u16,
    pub value: Vec<u8>,
}

impl RawAttribute {
    /// Decodes this attribute's value as a plain address
    /// (MAPPED-ADDRESS / CHANGED-ADDRESS / OTHER-ADDRESS layout).
    pub fn mapped_address(&self) -> Option<Host> {
        decode_address_value(&self.value, |bytes, _| bytes.to_vec(), &[])
    }

    /// Decodes this attribute's value as an XOR-mapped address.
    ///
    /// `xor_seed` is the 16-byte sequence (magic cookie || transaction ID)
    /// taken from bytes 4..20 of the carrying message's header.
    pub fn xor_mapped_address(&self, xor_seed: &[u8]) -> Option<Host> {
        decode_address_value(
            &self.value,
            |bytes, seed| bytes.iter().zip(seed).map(|(b, s)| b ^ s).collect(),
            xor_seed,
        )
    }
}

fn decode_address_value(
    value: &[u8],
    unmask: impl Fn(&[u8], &[u8]) -> Vec<u8>,
    xor_seed: &[u8],
) -> Option<Host> {
    if value.len() < 8 {
        return None;
    }
    let family = AddressFamily::from_code(value[1])?;
    let mut port = BigEndian::read_u16(&value[2..4]);
    if xor_seed.len() >= 2 {
        // The top half of the magic cookie, as carried in seed bytes 0..2.
        port ^= BigEndian::read_u16(&xor_seed[..2]);
    }
    let ip = match family {
        AddressFamily::V4 => {
            let bytes = unmask(&value[4..8], xor_seed);
            let octets: [u8; 4] = bytes.try_into().ok()?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        AddressFamily::V6 => {
            if value.len() < 20 {
                return None;
            }
            let bytes = unmask(&value[4..20], xor_seed);
            let octets: [u8; 16] = bytes.try_into().ok()?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };
    Some(Host::new(ip, port))
}

impl Host {
    /// Encodes this address as a plain MAPPED-ADDRESS style value
    /// (8 bytes for IPv4, 20 for IPv6).
    pub fn mapped_value(&self) -> Vec<u8> {
        self.address_value(&[])
    }

    /// Encodes this address as an XOR-MAPPED-ADDRESS value against the
    /// given 16-byte (magic cookie || transaction ID) seed.
    pub fn xor_mapped_value(&self, xor_seed: &[u8]) -> Vec<u8> {
        self.address_value(xor_seed)
    }

    fn address_value(&self, xor_seed: &[u8]) -> Vec<u8> {
        let mut port = self.port();
        if xor_seed.len() >= 2 {
            port ^= BigEndian::read_u16(&xor_seed[..2]);
        }
        let mut value = vec![0u8, self.family().code()];
        let mut port_bytes = [0u8; 2];
        BigEndian::write_u16(&mut port_bytes, port);
        value.extend_from_slice(&port_bytes);
        match self.ip() {
            IpAddr::V4(ip) => value.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => value.extend_from_slice(&ip.octets()),
        }
        for (byte, seed) in value[4..].iter_mut().zip(xor_seed) {
            *byte ^= seed;
        }
        value
    }
}

/// An ordered attribute list; decoding preserves receive order and
/// encoding preserves insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<RawAttribute>);

impl Attributes {
    /// Returns the first attribute with the given type, if any.
    pub fn get(&self, typ: AttrType) -> Option<&RawAttribute> {
        self.0.iter().find(|a| a.typ == typ)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawAttribute> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self, attr: RawAttribute) {
        self.0.push(attr);
    }
}

/// The discovery-relevant addresses extracted from a binding response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressInfo {
    /// The externally mapped address, XOR variants preferred over the
    /// plain MAPPED-ADDRESS.
    pub mapped: Option<Host>,
    /// CHANGED-ADDRESS, the server's alternate endpoint (RFC 3489).
    pub changed: Option<Host>,
    /// OTHER-ADDRESS, the RFC 5780 replacement for CHANGED-ADDRESS.
    pub other: Option<Host>,
}

impl AddressInfo {
    /// The alternate server endpoint to probe from a different 5-tuple:
    /// CHANGED-ADDRESS when present, OTHER-ADDRESS otherwise.
    pub fn alternate(&self) -> Option<Host> {
        self.changed.or(self.other)
    }
}

impl Message {
    /// Appends a SOFTWARE attribute carrying the given UTF-8 name.
    pub fn add_software(&mut self, name: &str) {
        self.add(AttrType::SOFTWARE, name.as_bytes());
    }

    /// Appends a CHANGE-REQUEST attribute asking the server to respond
    /// from its alternate IP and/or alternate port.
    pub fn add_change_request(&mut self, change_ip: bool, change_port: bool) {
        let mut value = [0u8; 4];
        if change_ip {
            value[3] |= 0x04;
        }
        if change_port {
            value[3] |= 0x02;
        }
        self.add(AttrType::CHANGE_REQUEST, &value);
    }

    /// Appends a FINGERPRINT attribute: the CRC-32 of the message bytes
    /// written so far, XORed with `0x5354554E`.
    pub fn add_fingerprint(&mut self) {
        let crc = crc32fast::hash(self.as_bytes()) ^ FINGERPRINT_XOR;
        let mut value = [0u8; 4];
        BigEndian::write_u32(&mut value, crc);
        self.add(AttrType::FINGERPRINT, &value);
    }

    /// Scans the attribute list for the addresses the discovery procedure
    /// cares about.
    pub fn address_info(&self) -> AddressInfo {
        let seed = self.xor_seed();
        let mut info = AddressInfo::default();
        for attr in self.attributes.iter() {
            match attr.typ {
                AttrType::XOR_MAPPED_ADDRESS | AttrType::XOR_MAPPED_ADDRESS_EXP => {
                    if let Some(host) = attr.xor_mapped_address(&seed) {
                        info.mapped = Some(host);
                    }
                }
                AttrType::MAPPED_ADDRESS => {
                    // Only used when no XOR variant decoded.
                    if info.mapped.is_none() {
                        info.mapped = attr.mapped_address();
                    }
                }
                AttrType::CHANGED_ADDRESS => {
                    info.changed = attr.mapped_address();
                }
                AttrType::OTHER_ADDRESS => {
                    info.other = attr.mapped_address();
                }
                _ => {}
            }
        }
        info
    }
}
