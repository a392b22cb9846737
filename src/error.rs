//! Crate-wide error type.
//!
//! Completion handlers receive these by value, so the type is `Clone` and
//! `PartialEq`; I/O failures are carried as their rendered message rather
//! than as `std::io::Error`.

use thiserror::Error;

use crate::codec::CodecError;

/// Errors surfaced by the agent, the client, and the discovery procedure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The agent has been torn down; no further transactions are accepted.
    #[error("agent is closed")]
    AgentClosed,
    /// The client has been torn down.
    #[error("client is closed")]
    ClientClosed,
    /// A transaction with the same ID is already registered.
    #[error("transaction exists with the same id")]
    DuplicateTransaction,
    /// No transaction with this ID is registered.
    #[error("transaction does not exist")]
    UnknownTransaction,
    /// The transaction was cancelled by an explicit stop.
    #[error("transaction is stopped")]
    StoppedTransaction,
    /// The transaction deadline elapsed before a response arrived.
    #[error("transaction timed out")]
    Timeout,
    /// A datagram could not be decoded as a STUN message.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A socket-level send or receive failure.
    #[error("transport I/O failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
