//! Server configuration.

use std::time::Duration;

use huddle_protocol::MAX_FRAME_SIZE;

use crate::error::{ServerError, ServerResult};

/// Default listening host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default listening port.
pub const DEFAULT_PORT: u16 = 9000;

/// Default number of commands queued for one client before it is evicted.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host or IP to listen on.
    pub host: String,

    /// TCP port to listen on. Zero picks an ephemeral port.
    pub port: u16,

    /// Upper bound on a single accept attempt. The shutdown flag is checked
    /// between attempts, so this is also the worst-case shutdown latency.
    pub accept_poll_interval: Duration,

    /// Largest accepted frame payload, in bytes.
    pub max_frame_size: u32,

    /// Commands queued for one client before it counts as stalled and is
    /// disconnected.
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            accept_poll_interval: Duration::from_secs(1),
            max_frame_size: MAX_FRAME_SIZE,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration listening on `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Builder: set the accept poll interval.
    pub fn with_accept_poll_interval(mut self, interval: Duration) -> Self {
        self.accept_poll_interval = interval;
        self
    }

    /// Builder: set the maximum frame size.
    pub fn with_max_frame_size(mut self, max: u32) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Builder: set the per-client outbound queue capacity.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Returns the `host:port` string to bind, bracketing IPv6 literals.
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Checks the configuration for values the server cannot run with.
    pub fn validate(&self) -> ServerResult<()> {
        if self.host.trim().is_empty() {
            return Err(ServerError::config("host must not be empty"));
        }
        if self.accept_poll_interval.is_zero() {
            return Err(ServerError::config("accept poll interval must be positive"));
        }
        if self.max_frame_size == 0 {
            return Err(ServerError::config("max frame size must be positive"));
        }
        if self.outbound_capacity == 0 {
            return Err(ServerError::config("outbound queue capacity must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
        assert_eq!(config.accept_poll_interval, Duration::from_secs(1));
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
        assert_eq!(config.outbound_capacity, DEFAULT_OUTBOUND_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn custom_config() {
        let config = ServerConfig::new("127.0.0.1", 0)
            .with_accept_poll_interval(Duration::from_millis(50))
            .with_max_frame_size(512)
            .with_outbound_capacity(16);

        assert_eq!(config.bind_addr(), "127.0.0.1:0");
        assert_eq!(config.accept_poll_interval, Duration::from_millis(50));
        assert_eq!(config.max_frame_size, 512);
        assert_eq!(config.outbound_capacity, 16);
    }

    #[test]
    fn ipv6_host_is_bracketed() {
        assert_eq!(ServerConfig::new("::1", 9000).bind_addr(), "[::1]:9000");
        assert_eq!(ServerConfig::new("[::1]", 9000).bind_addr(), "[::1]:9000");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let zero_poll = ServerConfig::default().with_accept_poll_interval(Duration::ZERO);
        assert!(matches!(zero_poll.validate(), Err(ServerError::Config { .. })));

        let zero_frame = ServerConfig::default().with_max_frame_size(0);
        assert!(zero_frame.validate().is_err());

        assert!(ServerConfig::new(" ", 9000).validate().is_err());

        let zero_queue = ServerConfig::default().with_outbound_capacity(0);
        assert!(zero_queue.validate().is_err());
    }
}
