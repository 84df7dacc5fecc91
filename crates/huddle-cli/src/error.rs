//! CLI error types.

use thiserror::Error;

use huddle_server::ServerError;

use crate::tracing::TracingError;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors reported by the `huddle` binary.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration file could not be read, parsed or serialized.
    #[error("configuration error: {0}")]
    Config(String),

    /// Relay server failure.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Logging could not be set up.
    #[error(transparent)]
    Tracing(#[from] TracingError),
}
