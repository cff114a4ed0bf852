//! Error types for the tunnel engine

use thiserror::Error;

use cvpn_protocol::Status;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a server or client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] cvpn_protocol::Error),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("timeout: {0}")]
    Timeout(String),

    /// Session reclaimed to make room for a new client
    #[error("session evicted")]
    Evicted,

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Script execution error
    #[error("script error: {0}")]
    Script(String),

    /// Shutdown requested
    #[error("shutdown requested")]
    Shutdown,
}

impl Error {
    /// Check if this is a recoverable error
    ///
    /// Transport failures and a full server pool are worth retrying; a
    /// rejected or garbled handshake is not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Io(_) | Error::Connection(_) | Error::Timeout(_) | Error::Evicted => true,
            Error::Protocol(e) => match e {
                cvpn_protocol::Error::Rejected(status) => {
                    matches!(status, Status::NoIpAvailable | Status::NoPortAvailable)
                }
                e => e.is_transport_error(),
            },
            _ => false,
        }
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}
