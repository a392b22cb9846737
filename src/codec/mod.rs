//! STUN wire format codec.
//!
//! Implements the message layout of [RFC 5389](https://datatracker.ietf.org/doc/html/rfc5389)
//! (20-byte header, magic cookie, 96-bit transaction ID, TLV attributes with
//! 4-byte padding) together with the RFC 3489 attributes the NAT discovery
//! procedure depends on (CHANGE-REQUEST, CHANGED-ADDRESS).

pub mod attributes;
pub mod host;
pub mod message;

use thiserror::Error;

pub use attributes::{AddressInfo, AttrType, Attributes, RawAttribute};
pub use host::{AddressFamily, Host};
pub use message::{Message, MessageClass, MessageType, Method};

/// The fixed 32-bit value that marks a packet as RFC 5389 STUN.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// XOR constant applied to the CRC-32 in the FINGERPRINT attribute
/// (the ASCII bytes of "STUN").
pub const FINGERPRINT_XOR: u32 = 0x5354_554E;

/// STUN header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// Transaction ID size in bytes (96 bits).
pub const TRANSACTION_ID_SIZE: usize = 12;

/// Attribute TLV header size (2-byte type + 2-byte length).
pub(crate) const ATTRIBUTE_HEADER_SIZE: usize = 4;

/// Attribute values are padded to this boundary.
pub(crate) const PADDING: usize = 4;

/// A 96-bit STUN transaction ID.
pub type TransactionId = [u8; TRANSACTION_ID_SIZE];

/// Decode failures for inbound datagrams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The buffer is shorter than the 20-byte STUN header.
    #[error("buffer of {0} bytes is too short for the 20-byte header")]
    HeaderTruncated(usize),
    /// The cookie field does not hold the STUN magic value.
    #[error("0x{0:08x} is not the STUN magic cookie")]
    BadCookie(u32),
    /// The header declares more attribute bytes than the buffer holds.
    #[error("message declares {expected} bytes but buffer holds {actual}")]
    BodyTruncated { expected: usize, actual: usize },
    /// An attribute TLV runs past the end of the message body.
    #[error("attribute needs {needed} bytes but only {remaining} remain")]
    AttributeTruncated { needed: usize, remaining: usize },
}

/// Rounds an attribute value length up to the 4-byte padding boundary.
pub(crate) fn nearest_padded_len(len: usize) -> usize {
    let rem = len % PADDING;
    if rem == 0 {
        len
    } else {
        len + PADDING - rem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_arithmetic() {
        assert_eq!(nearest_padded_len(0), 0);
        assert_eq!(nearest_padded_len(1), 4);
        assert_eq!(nearest_padded_len(4), 4);
        assert_eq!(nearest_padded_len(5), 8);
        assert_eq!(nearest_padded_len(8), 8);
        assert_eq!(nearest_padded_len(13), 16);
    }
}
