//! Configuration commands.

use std::path::Path;

use crate::config::HuddleConfig;
use crate::error::{CliError, CliResult};

/// Dump the effective configuration to stdout.
pub fn dump(config: &HuddleConfig, path: &Path) -> CliResult<()> {
    println!("# config.toml ({})", path.display());
    println!("{}", config.to_toml()?);
    Ok(())
}

/// Validate the configuration by building the server settings from it.
pub fn validate(config: &HuddleConfig) -> CliResult<()> {
    config
        .server
        .to_server_config(None, None)
        .validate()
        .map_err(|e| CliError::Config(e.to_string()))?;

    println!("Configuration is valid.");
    Ok(())
}

/// Show the configuration file path.
pub fn path(path: &Path) -> CliResult<()> {
    let state = if path.exists() { "" } else { " (not found, using defaults)" };
    println!("config: {}{}", path.display(), state);
    Ok(())
}
