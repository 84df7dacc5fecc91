//! Run the relay server in the foreground.

use tracing::info;

use huddle_server::{RelayServer, ServerConfig, ShutdownHandle, SignalHandler};

use crate::error::CliResult;

/// Binds the relay and serves until SIGINT/SIGTERM.
pub async fn run(config: ServerConfig) -> CliResult<()> {
    let server = RelayServer::bind(config).await?;

    let signals = SignalHandler::new(ShutdownHandle::new());
    signals.spawn_listener();
    let server = server.with_shutdown(signals.shutdown_handle());
    info!(addr = %server.local_addr()?, "Press Ctrl+C to stop");

    server.run().await?;
    Ok(())
}
