//! Configuration file for the `huddle` binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use huddle_server::{DEFAULT_HOST, DEFAULT_PORT, ServerConfig};

use crate::error::{CliError, CliResult};

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HuddleConfig {
    /// Enable debug logging.
    pub debug: bool,

    /// Relay server settings.
    pub server: ServerSettings,
}

/// The `[server]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host or IP to listen on.
    pub host: String,

    /// TCP port to listen on.
    pub port: u16,

    /// Accept poll interval in milliseconds.
    pub accept_poll_ms: u64,

    /// Largest accepted frame payload, in bytes.
    pub max_frame_size: u32,

    /// Commands queued per client before a stalled client is dropped.
    pub outbound_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            accept_poll_ms: defaults.accept_poll_interval.as_millis() as u64,
            max_frame_size: defaults.max_frame_size,
            outbound_capacity: defaults.outbound_capacity,
        }
    }
}

impl ServerSettings {
    /// Builds the server configuration, applying command-line overrides.
    pub fn to_server_config(&self, host: Option<&str>, port: Option<u16>) -> ServerConfig {
        ServerConfig::new(host.unwrap_or(&self.host), port.unwrap_or(self.port))
            .with_accept_poll_interval(Duration::from_millis(self.accept_poll_ms))
            .with_max_frame_size(self.max_frame_size)
            .with_outbound_capacity(self.outbound_capacity)
    }
}

impl HuddleConfig {
    /// Loads configuration from the default path, or defaults if there is
    /// no file.
    pub fn load() -> CliResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| CliError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> CliResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CliError::Config(format!("failed to serialize config: {}", e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("huddle")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_match_server_defaults() {
        let config = HuddleConfig::default();
        assert!(!config.debug);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.accept_poll_ms, 1000);
        assert_eq!(config.server.max_frame_size, 1024 * 1024);
        assert_eq!(config.server.outbound_capacity, 1024);
    }

    #[test]
    fn load_partial_file() {
        let file = write_config(
            r#"
debug = true

[server]
port = 9100
"#,
        );
        let config = HuddleConfig::load_from(file.path()).unwrap();
        assert!(config.debug);
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.accept_poll_ms, 1000);
    }

    #[test]
    fn load_full_file() {
        let file = write_config(
            r#"
[server]
host = "127.0.0.1"
port = 9200
accept_poll_ms = 250
max_frame_size = 4096
outbound_capacity = 64
"#,
        );
        let config = HuddleConfig::load_from(file.path()).unwrap();
        let server = config.server.to_server_config(None, None);
        assert_eq!(server.bind_addr(), "127.0.0.1:9200");
        assert_eq!(server.accept_poll_interval, Duration::from_millis(250));
        assert_eq!(server.max_frame_size, 4096);
        assert_eq!(server.outbound_capacity, 64);
    }

    #[test]
    fn cli_overrides_file() {
        let settings = ServerSettings::default();
        let server = settings.to_server_config(Some("::1"), Some(7000));
        assert_eq!(server.bind_addr(), "[::1]:7000");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let file = write_config("[server]\nport = \"not a number\"\n");
        assert!(matches!(
            HuddleConfig::load_from(file.path()),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            HuddleConfig::load_from(&dir.path().join("absent.toml")),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn toml_round_trip() {
        let mut config = HuddleConfig::default();
        config.debug = true;
        config.server.port = 9300;
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[server]"));
        let parsed: HuddleConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn default_path_ends_with_huddle_config() {
        let path = HuddleConfig::default_path();
        assert!(path.ends_with("huddle/config.toml"));
    }
}
