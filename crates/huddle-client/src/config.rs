//! Client configuration.

use std::time::Duration;

use crate::error::{ClientError, ClientResult};

/// Settings for one participant.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay address as `host:port`.
    pub server_addr: String,

    /// Nickname to register with.
    pub nickname: String,

    /// Bound on connecting to the relay and on waiting for its answer to
    /// `REGISTER`.
    pub connect_timeout: Duration,

    /// How long an outgoing chat invite waits for the invitee to connect.
    pub invite_timeout: Duration,

    /// Bound on the nickname exchange that opens a private session.
    pub handshake_timeout: Duration,
}

impl ClientConfig {
    /// Creates a configuration for `nickname` talking to `server_addr`.
    pub fn new(server_addr: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            nickname: nickname.into(),
            connect_timeout: Duration::from_secs(5),
            invite_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Builder: set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder: set the invite timeout.
    pub fn with_invite_timeout(mut self, timeout: Duration) -> Self {
        self.invite_timeout = timeout;
        self
    }

    /// Builder: set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Checks that the nickname can travel as a single protocol word.
    pub fn validate(&self) -> ClientResult<()> {
        if self.nickname.is_empty() {
            return Err(ClientError::Config("nickname must not be empty".into()));
        }
        if self.nickname.chars().any(char::is_whitespace) {
            return Err(ClientError::Config(
                "nickname must not contain whitespace".into(),
            ));
        }
        if self.nickname.contains(':') {
            return Err(ClientError::Config("nickname must not contain ':'".into()));
        }
        if self.server_addr.trim().is_empty() {
            return Err(ClientError::Config("server address must not be empty".into()));
        }
        Ok(())
    }
}
