//! Error types for the estate stack.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A packet failed to parse or verify. Always a soft drop: logged, counted,
/// and the packet is discarded without propagating further.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub struct PacketError {
    /// Human readable description of the failure.
    pub message: String,
}

impl PacketError {
    /// Builds a new packet error with the given message.
    pub fn new<T: AsRef<str>>(s: T) -> Self {
        Self {
            message: s.as_ref().to_string(),
        }
    }
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Top level error type.
///
/// Only [`Error::Stack`] indicates a programming-contract violation and is
/// allowed to propagate out of the service loop. Every other variant is a
/// soft-drop condition that the stack absorbs internally (logged and
/// counted in stats).
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed header/body, failed signature or MAC, or decrypt failure.
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// Programming-contract violation: duplicate uid/name, moving a
    /// non-existent remote, etc.
    #[error("stack error: {0}")]
    Stack(String),

    /// A transaction's deadline passed without completion.
    #[error("transaction timed out")]
    TransactionTimeout,

    /// The socket reported transient backpressure (EAGAIN/EWOULDBLOCK).
    #[error("socket would block")]
    WouldBlock,

    /// The destination estate id on an inbound packet does not match the
    /// local estate and is not a wildcard.
    #[error("invalid destination eid {0}")]
    InvalidDestination(u32),

    /// `retrieve_remote` was asked for an estate id that does not exist and
    /// could not be synthesised.
    #[error("invalid remote eid {0:?}")]
    InvalidRemoteEid(Option<u32>),

    /// A non-join packet arrived with `si == 0`.
    #[error("invalid sid attempt")]
    InvalidSidAttempt,

    /// A packet's session id failed the remote's replay check.
    #[error("stale sid attempt")]
    StaleSidAttempt,

    /// A packet could not be matched to any transaction and was not a
    /// fresh correspondent request either.
    #[error("stale packet")]
    StalePacket,

    /// A message body was not a keyed mapping.
    #[error("invalid transmit body")]
    InvalidTransmitBody,

    /// An I/O error from the socket abstraction that is not a
    /// backpressure signal.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Name of the stat counter this error should be recorded under, if
    /// any. `Stack` errors are not counted because they are not meant to be
    /// survived.
    pub fn stat_name(&self) -> Option<&'static str> {
        match self {
            Error::Packet(_) => Some("parsing_outer_error"),
            Error::Stack(_) => None,
            Error::TransactionTimeout => Some("transaction_timeout"),
            Error::WouldBlock => None,
            Error::InvalidDestination(_) => Some("invalid_destination"),
            Error::InvalidRemoteEid(_) => Some("invalid_remote_eid"),
            Error::InvalidSidAttempt => Some("invalid_sid_attempt"),
            Error::StaleSidAttempt => Some("stale_sid_attempt"),
            Error::StalePacket => Some("stale_packet"),
            Error::InvalidTransmitBody => Some("invalid_transmit_body"),
            Error::Io(_) => None,
        }
    }
}
