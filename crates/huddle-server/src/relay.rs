//! TCP relay server.
//!
//! Accepts client connections, runs one worker per connection and owns the
//! [`Registry`] those workers share.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span};

use crate::config::ServerConfig;
use crate::connection;
use crate::error::{ServerError, ServerResult};
use crate::registry::{ConnectionId, Registry};
use crate::signals::ShutdownHandle;

/// Broadcast relay bound to a TCP address.
pub struct RelayServer {
    config: ServerConfig,
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown: ShutdownHandle,
}

impl RelayServer {
    /// Binds the listening socket described by `config`.
    pub async fn bind(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::bind(addr.clone(), e))?;

        info!(addr = %listener.local_addr()?, "Relay listening");

        Ok(Self {
            config,
            listener,
            registry: Arc::new(Registry::new()),
            shutdown: ShutdownHandle::new(),
        })
    }

    /// Builder: use an externally owned shutdown handle.
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Returns the bound address (useful when binding port 0).
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns the registry shared by this server's connections.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Returns a handle that stops [`RelayServer::run`].
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs the accept loop until the shutdown handle is triggered.
    ///
    /// Each accept attempt races the shutdown signal and is bounded by the
    /// configured poll interval, so a trigger is observed even if the signal
    /// is missed. On shutdown every tracked
    /// connection is closed and the registry is cleared.
    pub async fn run(self) -> ServerResult<()> {
        let Self {
            config,
            listener,
            registry,
            shutdown,
        } = self;

        let mut workers = JoinSet::new();
        let mut next_id: ConnectionId = 0;

        while !shutdown.is_shutdown() {
            // Reap finished workers.
            while workers.try_join_next().is_some() {}

            let accepted = tokio::select! {
                () = shutdown.wait().wait() => break,
                accepted = tokio::time::timeout(config.accept_poll_interval, listener.accept()) => accepted,
            };

            let (stream, peer) = match accepted {
                Err(_) => continue,
                Ok(Err(e)) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
                Ok(Ok(accepted)) => accepted,
            };

            next_id += 1;
            debug!(peer = %peer, id = next_id, "Accepted new connection");

            let span = info_span!("connection", id = next_id, peer = %peer);
            workers.spawn(
                connection::serve(
                    stream,
                    peer,
                    next_id,
                    registry.clone(),
                    config.max_frame_size,
                    config.outbound_capacity,
                )
                .instrument(span),
            );
        }

        info!("Shutdown requested, closing connections");
        drop(listener);

        workers.abort_all();
        while workers.join_next().await.is_some() {}

        let dropped = registry.clear().await;
        info!(clients = dropped, "Relay stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    use huddle_protocol::{Command, FrameDecoder, UserEntry};

    use super::*;
    use crate::connection::{IPV6_UNSUPPORTED, NICKNAME_TAKEN};

    const WAIT: Duration = Duration::from_secs(5);

    struct TestRelay {
        addr: SocketAddr,
        registry: Arc<Registry>,
        shutdown: ShutdownHandle,
        task: JoinHandle<ServerResult<()>>,
    }

    async fn start_relay() -> TestRelay {
        start_relay_with(ServerConfig::new("127.0.0.1", 0)).await
    }

    async fn start_relay_with(config: ServerConfig) -> TestRelay {
        let config = config.with_accept_poll_interval(Duration::from_millis(50));
        let server = RelayServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        TestRelay {
            addr,
            registry,
            shutdown,
            task,
        }
    }

    /// Raw wire-level client.
    struct Peer {
        stream: TcpStream,
        decoder: FrameDecoder,
        pending: Vec<Command>,
    }

    impl Peer {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                decoder: FrameDecoder::new(),
                pending: Vec::new(),
            }
        }

        async fn register(addr: SocketAddr, nick: &str, udp: &str) -> Self {
            let mut peer = Self::connect(addr).await;
            peer.send(&Command::register(nick, udp)).await;
            assert_eq!(peer.recv().await, Some(Command::welcome(nick)));
            assert!(matches!(peer.recv().await, Some(Command::UserList(_))));
            peer
        }

        async fn send(&mut self, command: &Command) {
            self.stream
                .write_all(&command.encode().unwrap())
                .await
                .unwrap();
        }

        /// Next command, or `None` once the relay closed the socket.
        async fn recv(&mut self) -> Option<Command> {
            let mut buf = [0u8; 1024];
            loop {
                if !self.pending.is_empty() {
                    return Some(self.pending.remove(0));
                }
                let n = tokio::time::timeout(WAIT, self.stream.read(&mut buf))
                    .await
                    .expect("timed out waiting for relay")
                    .unwrap_or(0);
                if n == 0 {
                    return None;
                }
                for frame in self.decoder.push(&buf[..n]).unwrap() {
                    if let Some(command) = Command::from_payload(&frame).unwrap() {
                        self.pending.push(command);
                    }
                }
            }
        }

        /// Asserts nothing arrives within a short window.
        async fn assert_silent(&mut self) {
            assert!(self.pending.is_empty(), "unexpected {:?}", self.pending);
            let mut buf = [0u8; 1024];
            let read = tokio::time::timeout(Duration::from_millis(150), self.stream.read(&mut buf)).await;
            assert!(read.is_err(), "unexpected data from relay");
        }
    }

    async fn wait_for_len(registry: &Registry, expected: usize) {
        tokio::time::timeout(WAIT, async {
            while registry.len().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry never reached expected size");
    }

    #[tokio::test]
    async fn register_sends_welcome_then_userlist() {
        let relay = start_relay().await;
        let mut alice = Peer::connect(relay.addr).await;
        alice.send(&Command::register("alice", "40001")).await;

        assert_eq!(alice.recv().await, Some(Command::welcome("alice")));
        assert_eq!(
            alice.recv().await,
            Some(Command::UserList(vec![UserEntry::new(
                "alice",
                "127.0.0.1",
                "40001"
            )]))
        );
        assert_eq!(relay.registry.len().await, 1);
    }

    #[tokio::test]
    async fn others_learn_about_joins() {
        let relay = start_relay().await;
        let mut alice = Peer::register(relay.addr, "alice", "40001").await;
        let _bob = Peer::register(relay.addr, "bob", "40002").await;

        assert_eq!(
            alice.recv().await,
            Some(Command::UserJoined(UserEntry::new("bob", "127.0.0.1", "40002")))
        );
    }

    #[tokio::test]
    async fn duplicate_nickname_gets_error_and_close() {
        let relay = start_relay().await;
        let mut first = Peer::register(relay.addr, "bob", "5005").await;

        let mut second = Peer::connect(relay.addr).await;
        second.send(&Command::register("bob", "5005")).await;
        assert_eq!(second.recv().await, Some(Command::error(NICKNAME_TAKEN)));
        assert_eq!(second.recv().await, None);

        assert_eq!(relay.registry.len().await, 1);
        // The first owner sees neither a join nor a leave.
        first.assert_silent().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_sender() {
        let relay = start_relay().await;
        let mut alice = Peer::register(relay.addr, "alice", "1").await;
        let mut bob = Peer::register(relay.addr, "bob", "2").await;
        let mut carol = Peer::register(relay.addr, "carol", "3").await;

        // Drain join notices.
        assert!(matches!(alice.recv().await, Some(Command::UserJoined(_))));
        assert!(matches!(alice.recv().await, Some(Command::UserJoined(_))));
        assert!(matches!(bob.recv().await, Some(Command::UserJoined(_))));

        alice.send(&Command::broadcast("alice", "hi")).await;

        assert_eq!(bob.recv().await, Some(Command::broadcast("alice", "hi")));
        assert_eq!(carol.recv().await, Some(Command::broadcast("alice", "hi")));
        alice.assert_silent().await;
        bob.assert_silent().await;
        carol.assert_silent().await;
    }

    #[tokio::test]
    async fn broadcast_is_nfc_normalized() {
        let relay = start_relay().await;
        let mut alice = Peer::register(relay.addr, "alice", "1").await;
        let mut bob = Peer::register(relay.addr, "bob", "2").await;
        assert!(matches!(alice.recv().await, Some(Command::UserJoined(_))));

        // "e" followed by a combining acute accent.
        alice.send(&Command::broadcast("alice", "cafe\u{301}")).await;
        assert_eq!(
            bob.recv().await,
            Some(Command::broadcast("alice", "caf\u{e9}"))
        );
    }

    #[tokio::test]
    async fn broadcast_before_register_is_refused() {
        let relay = start_relay().await;
        let mut bob = Peer::register(relay.addr, "bob", "2").await;
        let mut anon = Peer::connect(relay.addr).await;

        anon.send(&Command::broadcast("mallory", "hello")).await;
        assert_eq!(anon.recv().await, Some(Command::error("not registered")));
        bob.assert_silent().await;
    }

    #[tokio::test]
    async fn malformed_broadcast_keeps_connection_open() {
        let relay = start_relay().await;
        let mut alice = Peer::register(relay.addr, "alice", "1").await;

        alice
            .stream
            .write_all(&huddle_protocol::encode_frame("BROADCAST alice").unwrap())
            .await
            .unwrap();
        assert!(matches!(alice.recv().await, Some(Command::Error { .. })));

        let mut bob = Peer::register(relay.addr, "bob", "2").await;
        assert!(matches!(alice.recv().await, Some(Command::UserJoined(_))));
        alice.send(&Command::broadcast("alice", "still here")).await;
        assert_eq!(bob.recv().await, Some(Command::broadcast("alice", "still here")));
    }

    #[tokio::test]
    async fn malformed_register_closes_connection() {
        let relay = start_relay().await;
        let mut peer = Peer::connect(relay.addr).await;
        peer.stream
            .write_all(&huddle_protocol::encode_frame("REGISTER lonely").unwrap())
            .await
            .unwrap();

        assert!(matches!(peer.recv().await, Some(Command::Error { .. })));
        assert_eq!(peer.recv().await, None);
        assert!(relay.registry.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_and_blank_frames_are_ignored() {
        let relay = start_relay().await;
        let mut alice = Peer::connect(relay.addr).await;
        alice
            .stream
            .write_all(&huddle_protocol::encode_frame("").unwrap())
            .await
            .unwrap();
        alice
            .stream
            .write_all(&huddle_protocol::encode_frame("PING now").unwrap())
            .await
            .unwrap();
        alice.send(&Command::register("alice", "1")).await;
        assert_eq!(alice.recv().await, Some(Command::welcome("alice")));
    }

    #[tokio::test]
    async fn frames_split_across_writes_are_reassembled() {
        let relay = start_relay().await;
        let mut alice = Peer::connect(relay.addr).await;

        let bytes = Command::register("alice", "40001").encode().unwrap();
        for byte in bytes {
            alice.stream.write_all(&[byte]).await.unwrap();
            alice.stream.flush().await.unwrap();
        }
        assert_eq!(alice.recv().await, Some(Command::welcome("alice")));
    }

    #[tokio::test]
    async fn user_left_once_per_disconnect_cause() {
        let relay = start_relay().await;
        let mut watcher = Peer::register(relay.addr, "watcher", "1").await;

        // Explicit QUIT.
        let mut quitter = Peer::register(relay.addr, "quitter", "2").await;
        assert!(matches!(watcher.recv().await, Some(Command::UserJoined(_))));
        quitter.send(&Command::Quit).await;
        assert_eq!(watcher.recv().await, Some(Command::user_left("quitter")));

        // Clean close.
        let closer = Peer::register(relay.addr, "closer", "3").await;
        assert!(matches!(watcher.recv().await, Some(Command::UserJoined(_))));
        drop(closer);
        assert_eq!(watcher.recv().await, Some(Command::user_left("closer")));

        // Abrupt reset.
        let resetter = Peer::register(relay.addr, "resetter", "4").await;
        assert!(matches!(watcher.recv().await, Some(Command::UserJoined(_))));
        resetter.stream.set_linger(Some(Duration::ZERO)).unwrap();
        drop(resetter);
        assert_eq!(watcher.recv().await, Some(Command::user_left("resetter")));

        watcher.assert_silent().await;
        wait_for_len(&relay.registry, 1).await;
    }

    #[tokio::test]
    async fn nickname_is_reusable_after_leave() {
        let relay = start_relay().await;
        let first = Peer::register(relay.addr, "bob", "1").await;
        drop(first);
        wait_for_len(&relay.registry, 0).await;

        let _again = Peer::register(relay.addr, "bob", "2").await;
        assert_eq!(relay.registry.len().await, 1);
    }

    #[tokio::test]
    async fn second_register_on_same_connection_is_refused() {
        let relay = start_relay().await;
        let mut alice = Peer::register(relay.addr, "alice", "1").await;
        alice.send(&Command::register("alicia", "1")).await;
        assert_eq!(alice.recv().await, Some(Command::error("already registered")));
        assert!(!relay.registry.contains("alicia").await);
        assert!(relay.registry.contains("alice").await);
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let config = ServerConfig::new("127.0.0.1", 0)
            .with_accept_poll_interval(Duration::from_millis(50))
            .with_max_frame_size(64);
        let server = RelayServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let mut peer = Peer::connect(addr).await;
        peer.stream.write_all(&1000u32.to_be_bytes()).await.unwrap();
        assert!(matches!(peer.recv().await, Some(Command::Error { .. })));
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn shutdown_closes_connections_and_clears_registry() {
        let relay = start_relay().await;
        let mut alice = Peer::register(relay.addr, "alice", "1").await;
        let mut lurker = Peer::connect(relay.addr).await;

        relay.shutdown.trigger();
        let result = tokio::time::timeout(WAIT, relay.task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));

        assert!(relay.registry.is_empty().await);
        assert_eq!(alice.recv().await, None);
        assert_eq!(lurker.recv().await, None);
        assert!(TcpStream::connect(relay.addr).await.is_err());
    }

    #[tokio::test]
    async fn servers_do_not_share_registries() {
        let one = start_relay().await;
        let two = start_relay().await;

        let _a = Peer::register(one.addr, "alice", "1").await;
        let _b = Peer::register(two.addr, "alice", "1").await;

        assert_eq!(one.registry.len().await, 1);
        assert_eq!(two.registry.len().await, 1);
    }

    #[tokio::test]
    async fn shutdown_does_not_wait_for_poll_interval() {
        let config = ServerConfig::new("127.0.0.1", 0)
            .with_accept_poll_interval(Duration::from_secs(60));
        let server = RelayServer::bind(config).await.unwrap();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("relay kept waiting on accept")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn ipv6_clients_are_refused() {
        // Skip on hosts without IPv6 loopback.
        let Ok(server) = RelayServer::bind(
            ServerConfig::new("::1", 0).with_accept_poll_interval(Duration::from_millis(50)),
        )
        .await
        else {
            return;
        };
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        let mut alice = Peer::connect(addr).await;
        alice.send(&Command::register("alice", "40001")).await;
        assert_eq!(alice.recv().await, Some(Command::error(IPV6_UNSUPPORTED)));
        assert_eq!(alice.recv().await, None);
        assert!(registry.is_empty().await);

        shutdown.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_recipient_does_not_affect_others() {
        let relay = start_relay().await;
        let mut alice = Peer::register(relay.addr, "alice", "40001").await;
        let mut bob = Peer::register(relay.addr, "bob", "40002").await;
        assert!(matches!(alice.recv().await, Some(Command::UserJoined(_))));
        let carol = Peer::register(relay.addr, "carol", "40003").await;
        assert!(matches!(alice.recv().await, Some(Command::UserJoined(_))));
        assert!(matches!(bob.recv().await, Some(Command::UserJoined(_))));

        carol.stream.set_linger(Some(Duration::ZERO)).unwrap();
        drop(carol);

        alice.send(&Command::broadcast("alice", "still there")).await;

        let mut seen = vec![bob.recv().await.unwrap(), bob.recv().await.unwrap()];
        seen.sort_by_key(|command| command.name());
        assert_eq!(
            seen,
            vec![
                Command::broadcast("alice", "still there"),
                Command::user_left("carol"),
            ]
        );

        assert_eq!(alice.recv().await, Some(Command::user_left("carol")));
        alice.assert_silent().await;
        wait_for_len(&relay.registry, 2).await;
    }

    #[tokio::test]
    async fn stalled_client_is_evicted() {
        let relay = start_relay_with(ServerConfig::new("127.0.0.1", 0).with_outbound_capacity(4)).await;
        let mut alice = Peer::register(relay.addr, "alice", "40001").await;
        // Carol registers and then never reads again.
        let _carol = Peer::register(relay.addr, "carol", "40002").await;
        assert!(matches!(alice.recv().await, Some(Command::UserJoined(_))));

        let chunk = "x".repeat(64 * 1024);
        let mut sent = 0;
        while relay.registry.contains("carol").await {
            assert!(sent < 2048, "stalled client was never evicted");
            alice.send(&Command::broadcast("alice", chunk.as_str())).await;
            sent += 1;
        }

        assert_eq!(alice.recv().await, Some(Command::user_left("carol")));
        alice.assert_silent().await;
        assert_eq!(relay.registry.len().await, 1);
    }
}
