//! STUN binding client and RFC 3489 NAT type discovery over UDP.
//!
//! Implements the client side of the STUN binding protocol
//! ([RFC 5389](https://datatracker.ietf.org/doc/html/rfc5389) message
//! format) and the classic NAT type discovery procedure of
//! [RFC 3489](https://datatracker.ietf.org/doc/html/rfc3489): a sequence
//! of probes classifies the network position as open internet, full cone,
//! restricted or port restricted cone, symmetric NAT, symmetric UDP
//! firewall, or blocked UDP.
//!
//! ```no_run
//! use natprobe::{Discovery, DiscoveryConfig};
//!
//! # async fn run() -> Result<(), natprobe::Error> {
//! let mut discovery = Discovery::connect(DiscoveryConfig::new("stun.example.org:3478")).await?;
//! let nat_type = discovery.discover().await?;
//! println!("{}", nat_type);
//! if let Some(mapped) = discovery.mapped_address() {
//!     println!("external address: {}", mapped);
//! }
//! discovery.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod client;
pub mod codec;
pub mod discovery;
pub mod error;

pub use agent::{Agent, Event, Handler};
pub use client::{Client, ClientConfig};
pub use codec::{
    AttrType, Attributes, CodecError, Host, Message, MessageClass, MessageType, Method,
    TransactionId,
};
pub use discovery::{Discovery, DiscoveryConfig, NatType};
pub use error::Error;
