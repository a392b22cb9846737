//! STUN message model and header/body codec.
//!
//! A [`Message`] keeps its parsed fields and its serialized byte buffer
//! consistent: every mutator updates both, so [`Message::as_bytes`] is always
//! ready to write to a socket.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic Cookie                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! |                     Transaction ID (96 bits)                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;

use super::attributes::{AttrType, Attributes, RawAttribute};
use super::{
    nearest_padded_len, CodecError, TransactionId, ATTRIBUTE_HEADER_SIZE, HEADER_SIZE,
    MAGIC_COOKIE,
};

/// A 12-bit STUN method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Method(u16);

impl Method {
    pub const BINDING: Method = Method(0x001);
    pub const ALLOCATE: Method = Method(0x003);
    pub const REFRESH: Method = Method(0x004);
    pub const SEND: Method = Method(0x006);
    pub const DATA: Method = Method(0x007);
    pub const CREATE_PERMISSION: Method = Method(0x008);
    pub const CHANNEL_BIND: Method = Method(0x009);

    pub const fn new(value: u16) -> Self {
        Method(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Method::BINDING => "binding",
            Method::ALLOCATE => "allocate",
            Method::REFRESH => "refresh",
            Method::SEND => "send",
            Method::DATA => "data",
            Method::CREATE_PERMISSION => "create permission",
            Method::CHANNEL_BIND => "channel bind",
            Method(other) => return write!(f, "0x{other:03x}"),
        };
        f.write_str(name)
    }
}

/// The two class bits of a STUN message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageClass::Request => "request",
            MessageClass::Indication => "indication",
            MessageClass::SuccessResponse => "success response",
            MessageClass::ErrorResponse => "error response",
        })
    }
}

// Method bit groups within the 16-bit type field and the shifts that
// interleave them with the two class bits (RFC 5389 Section 6):
//
//  0                 1
//  2  3  4 5 6 7 8 9 0 1 2 3 4 5
// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
const METHOD_A_BITS: u16 = 0x000F; // M0-M3
const METHOD_B_BITS: u16 = 0x0070; // M4-M6
const METHOD_D_BITS: u16 = 0x0F80; // M7-M11
const METHOD_B_SHIFT: u16 = 1;
const METHOD_D_SHIFT: u16 = 2;
const CLASS_C0_SHIFT: u16 = 4;
const CLASS_C1_SHIFT: u16 = 7;

/// A STUN message type: method plus class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageType {
    pub method: Method,
    pub class: MessageClass,
}

impl MessageType {
    pub const BINDING_REQUEST: MessageType =
        MessageType::new(Method::BINDING, MessageClass::Request);
    pub const BINDING_SUCCESS: MessageType =
        MessageType::new(Method::BINDING, MessageClass::SuccessResponse);
    pub const BINDING_ERROR: MessageType =
        MessageType::new(Method::BINDING, MessageClass::ErrorResponse);

    pub const fn new(method: Method, class: MessageClass) -> Self {
        MessageType { method, class }
    }

    /// Encodes the type into the low 14 bits of the wire field.
    pub fn to_u16(self) -> u16 {
        let m = self.method.value();
        let method = (m & METHOD_A_BITS)
            | ((m & METHOD_B_BITS) << METHOD_B_SHIFT)
            | ((m & METHOD_D_BITS) << METHOD_D_SHIFT);
        let c = self.class.bits();
        let class = ((c & 0b01) << CLASS_C0_SHIFT) | ((c & 0b10) << CLASS_C1_SHIFT);
        method | class
    }

    /// Decodes a wire type field back into method and class.
    pub fn from_u16(value: u16) -> Self {
        let c0 = (value >> CLASS_C0_SHIFT) & 0b01;
        let c1 = (value >> CLASS_C1_SHIFT) & 0b10;
        let method = (value & METHOD_A_BITS)
            | ((value >> METHOD_B_SHIFT) & METHOD_B_BITS)
            | ((value >> METHOD_D_SHIFT) & METHOD_D_BITS);
        MessageType {
            method: Method::new(method),
            class: MessageClass::from_bits(c0 | c1),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.class)
    }
}

/// An in-memory STUN message.
///
/// The `raw` buffer always mirrors the serialized form: a 20-byte header
/// followed by the encoded attributes, with the header length field equal
/// to [`Message::length`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub typ: MessageType,
    /// Attribute byte count, excluding the header.
    pub length: u16,
    pub transaction_id: TransactionId,
    pub attributes: Attributes,
    raw: Vec<u8>,
}

impl Message {
    /// Creates an empty message of the given type with a zeroed
    /// transaction ID and a fully written header.
    pub fn new(typ: MessageType) -> Self {
        let mut m = Message {
            typ,
            length: 0,
            transaction_id: [0; 12],
            attributes: Attributes::default(),
            raw: vec![0; HEADER_SIZE],
        };
        m.write_header();
        m
    }

    /// The serialized message, ready for the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// The 16-byte (magic cookie || transaction ID) sequence used to mask
    /// XOR-mapped addresses, i.e. header bytes 4..20.
    pub fn xor_seed(&self) -> [u8; 16] {
        let mut seed = [0u8; 16];
        seed.copy_from_slice(&self.raw[4..HEADER_SIZE]);
        seed
    }

    /// Replaces the message type, updating the buffer.
    pub fn set_type(&mut self, typ: MessageType) {
        self.typ = typ;
        BigEndian::write_u16(&mut self.raw[0..2], typ.to_u16());
    }

    /// Replaces the transaction ID, updating the buffer.
    pub fn set_transaction_id(&mut self, id: TransactionId) {
        self.transaction_id = id;
        self.raw[8..HEADER_SIZE].copy_from_slice(&id);
    }

    /// Draws a fresh random 96-bit transaction ID.
    ///
    /// `rand::thread_rng` is a CSPRNG, which RFC 5389 Section 6 asks for.
    pub fn new_transaction_id(&mut self) {
        let mut id: TransactionId = [0; 12];
        rand::thread_rng().fill(&mut id);
        self.set_transaction_id(id);
    }

    /// Returns the first value for the given attribute type.
    pub fn get(&self, typ: AttrType) -> Option<&[u8]> {
        self.attributes.get(typ).map(|a| a.value.as_slice())
    }

    /// Appends an attribute TLV, zero-padding the value to a 4-byte
    /// boundary and updating the recorded length.
    pub fn add(&mut self, typ: AttrType, value: &[u8]) {
        let padded = nearest_padded_len(value.len());
        self.raw.reserve(ATTRIBUTE_HEADER_SIZE + padded);

        let mut tl = [0u8; ATTRIBUTE_HEADER_SIZE];
        BigEndian::write_u16(&mut tl[0..2], typ.value());
        BigEndian::write_u16(&mut tl[2..4], value.len() as u16);
        self.raw.extend_from_slice(&tl);
        self.raw.extend_from_slice(value);
        // Padding bytes are written as zeros so stale buffer contents
        // never reach the wire.
        self.raw.resize(self.raw.len() + (padded - value.len()), 0);

        self.length += (ATTRIBUTE_HEADER_SIZE + padded) as u16;
        self.write_length();
        self.attributes.push(RawAttribute {
            typ,
            length: value.len() as u16,
            value: value.to_vec(),
        });
    }

    fn write_length(&mut self) {
        BigEndian::write_u16(&mut self.raw[2..4], self.length);
    }

    fn write_header(&mut self) {
        BigEndian::write_u16(&mut self.raw[0..2], self.typ.to_u16());
        BigEndian::write_u16(&mut self.raw[2..4], self.length);
        BigEndian::write_u32(&mut self.raw[4..8], MAGIC_COOKIE);
        self.raw[8..HEADER_SIZE].copy_from_slice(&self.transaction_id);
    }

    /// Decodes a received datagram.
    ///
    /// Checks run in order: header size, magic cookie, declared body
    /// length, then each attribute TLV. The stored attribute value is the
    /// unpadded prefix; the read cursor advances past the padding.
    pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::HeaderTruncated(buf.len()));
        }
        let cookie = BigEndian::read_u32(&buf[4..8]);
        if cookie != MAGIC_COOKIE {
            return Err(CodecError::BadCookie(cookie));
        }
        let size = BigEndian::read_u16(&buf[2..4]) as usize;
        let full_size = HEADER_SIZE + size;
        if buf.len() < full_size {
            return Err(CodecError::BodyTruncated {
                expected: full_size,
                actual: buf.len(),
            });
        }

        let mut m = Message {
            typ: MessageType::from_u16(BigEndian::read_u16(&buf[0..2])),
            length: size as u16,
            transaction_id: [0; 12],
            attributes: Attributes::default(),
            raw: buf[..full_size].to_vec(),
        };
        m.transaction_id.copy_from_slice(&buf[8..HEADER_SIZE]);

        let mut body = &buf[HEADER_SIZE..full_size];
        while !body.is_empty() {
            if body.len() < ATTRIBUTE_HEADER_SIZE {
                return Err(CodecError::AttributeTruncated {
                    needed: ATTRIBUTE_HEADER_SIZE,
                    remaining: body.len(),
                });
            }
            let typ = AttrType::new(BigEndian::read_u16(&body[0..2]));
            let length = BigEndian::read_u16(&body[2..4]);
            let padded = nearest_padded_len(length as usize);
            body = &body[ATTRIBUTE_HEADER_SIZE..];
            if body.len() < padded {
                return Err(CodecError::AttributeTruncated {
                    needed: padded,
                    remaining: body.len(),
                });
            }
            m.attributes.push(RawAttribute {
                typ,
                length,
                value: body[..length as usize].to_vec(),
            });
            body = &body[padded..];
        }
        Ok(m)
    }
}
