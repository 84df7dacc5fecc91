//! Participant side of huddle.
//!
//! A [`RendezvousClient`] registers a nickname with the relay, follows the
//! user list and group broadcasts, and listens for private chat invites on
//! its own UDP socket. Invites are sent and answered through a
//! [`ChatNegotiator`]; an accepted invite becomes a [`PrivateSession`], a
//! direct TCP stream between the two peers.
//!
//! Everything the client observes is reported through a [`ChatObserver`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use huddle_client::{ChannelObserver, ChatEvent, ClientConfig, RendezvousClient};
//!
//! # async fn example() -> huddle_client::ClientResult<()> {
//! let (observer, mut events) = ChannelObserver::new();
//! let mut client = RendezvousClient::new(
//!     ClientConfig::new("127.0.0.1:9000", "alice"),
//!     Arc::new(observer),
//! );
//! client.connect().await?;
//! client.send_broadcast("hello everyone").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ChatEvent::ChatRequest(invite) = event {
//!         let session = client.accept_invite(invite).await?;
//!         session.send("hi!").await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod negotiator;
pub mod rendezvous;
pub mod session;

pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use events::{ChannelObserver, ChatEvent, ChatInvite, ChatObserver, NoopObserver};
pub use negotiator::ChatNegotiator;
pub use rendezvous::{ClientState, RendezvousClient};
pub use session::{PrivateSession, SessionEvent, SessionInfo, SessionPhase};
