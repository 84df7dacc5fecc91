//! Client error types.

use std::fmt;

use huddle_protocol::ProtocolError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug)]
pub enum ClientError {
    /// Configuration error.
    Config(String),
    /// IO error.
    Io(std::io::Error),
    /// Connection to the relay failed.
    Connection(String),
    /// Protocol/framing error.
    Protocol(String),
    /// The relay refused the registration.
    Rejected(String),
    /// Operation needs an active relay connection.
    NotConnected,
    /// Operation timed out.
    Timeout(String),
    /// Nickname exchange with a peer failed.
    Handshake(String),
    /// Private session is unusable.
    Session(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Connection(msg) => write!(f, "connection error: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Rejected(reason) => write!(f, "registration rejected: {}", reason),
            Self::NotConnected => write!(f, "not connected to the relay"),
            Self::Timeout(msg) => write!(f, "timeout: {}", msg),
            Self::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            Self::Session(msg) => write!(f, "session error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(err) => Self::Io(err),
            other => Self::Protocol(other.to_string()),
        }
    }
}
