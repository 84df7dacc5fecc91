//! Relay server for the huddle chat.
//!
//! This crate provides:
//! - the [`Registry`] of registered nicknames, one per server instance
//! - the [`RelayServer`] accept loop with one worker per connection
//! - cooperative shutdown via [`ShutdownHandle`] and Unix signals
//!
//! # Example
//!
//! ```rust,no_run
//! use huddle_server::{RelayServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = RelayServer::bind(ServerConfig::default()).await?;
//!     let shutdown = server.shutdown_handle();
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.trigger();
//!     });
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;
mod registry;
mod relay;
mod signals;

pub use config::{DEFAULT_HOST, DEFAULT_OUTBOUND_CAPACITY, DEFAULT_PORT, ServerConfig};
pub use connection::{ConnectionPhase, IPV6_UNSUPPORTED, NICKNAME_TAKEN};
pub use error::{ServerError, ServerResult};
pub use registry::{Admission, ClientEntry, ConnectionHandle, ConnectionId, Registry};
pub use relay::RelayServer;
pub use signals::{ShutdownHandle, ShutdownSignal, SignalHandler};
