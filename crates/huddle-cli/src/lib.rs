//! huddle command-line interface.
//!
//! This crate provides the `huddle` binary: running the relay server and
//! inspecting its configuration file.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod tracing;

pub use cli::Cli;
pub use error::{CliError, CliResult};
