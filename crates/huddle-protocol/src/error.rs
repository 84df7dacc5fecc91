//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while framing or parsing protocol messages.
///
/// The `Display` text doubles as the reason carried in an `ERROR` reply,
/// so it is kept short and human-readable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u32, max: u32 },

    /// Payload is not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Command name is not part of the schema.
    #[error("unknown command: {name}")]
    UnknownCommand { name: String },

    /// Wrong number of arguments for a command.
    #[error("{command} expects {expected}, got {received}")]
    Arity {
        command: &'static str,
        expected: &'static str,
        received: usize,
    },

    /// An argument is present but malformed.
    #[error("{command}: {reason}")]
    InvalidArgument {
        command: &'static str,
        reason: String,
    },

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Datagram or buffer too short to hold a complete frame.
    #[error("incomplete message: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    /// Operation timed out.
    #[error("timeout during {operation}")]
    Timeout { operation: String },
}

impl ProtocolError {
    /// Creates an arity error.
    pub fn arity(command: &'static str, expected: &'static str, received: usize) -> Self {
        Self::Arity {
            command,
            expected,
            received,
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(command: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            command,
            reason: reason.into(),
        }
    }

    /// Returns true if the error leaves the byte stream unusable.
    ///
    /// Oversized frames cannot be skipped without trusting the peer's length
    /// prefix, so the connection has to be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MessageTooLarge { .. } | Self::Io(_) | Self::Timeout { .. }
        )
    }
}
