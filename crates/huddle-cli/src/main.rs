//! huddle CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use huddle_cli::cli::{Cli, Command, ConfigAction};
use huddle_cli::commands;
use huddle_cli::config::HuddleConfig;
use huddle_cli::error::CliResult;
use huddle_cli::tracing::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let path = cli.config.clone().unwrap_or_else(HuddleConfig::default_path);
    let config = if cli.config.is_some() {
        HuddleConfig::load_from(&path)?
    } else {
        HuddleConfig::load()?
    };

    init_tracing(TracingConfig::from_flags(
        cli.debug || config.debug,
        cli.log_format,
    ))?;

    match cli.command {
        Command::Serve { host, port } => {
            let server = config.server.to_server_config(host.as_deref(), port);
            commands::serve::run(server).await
        }
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config, &path),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(&path),
        },
    }
}
