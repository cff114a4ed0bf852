//! Error types for the cvpn protocol

use thiserror::Error;

use crate::handshake::Status;

/// Result type alias for cvpn protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("key too short: expected at least {expected} bytes, got {actual}")]
    KeyTooShort { expected: usize, actual: usize },

    #[error("buffer length mismatch: source {src} bytes, destination {dst} bytes")]
    LengthMismatch { src: usize, dst: usize },

    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("invalid packet data: {0}")]
    InvalidPacket(String),

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("no resource available in pool")]
    PoolEmpty,

    #[error("pool is full: {0} was not leased")]
    PoolFull(String),

    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("invalid port range: {0}")]
    InvalidRange(String),

    #[error("unknown handshake status: {0}")]
    UnknownStatus(u8),

    #[error("handshake rejected: {0}")]
    Rejected(Status),

    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error means the peer spoke the protocol wrongly or refused us
    ///
    /// Protocol errors are fatal to the connection and must not be retried.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidPacket(_)
                | Error::PacketTooShort { .. }
                | Error::FrameTooLarge(_)
                | Error::UnknownStatus(_)
                | Error::Rejected(_)
        )
    }

    /// Whether the error is a plain transport failure (socket closed or reset)
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Closed)
    }
}
