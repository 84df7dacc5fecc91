//! Connection to the rendezvous relay.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use huddle_protocol::{Command, FrameDecoder, UserEntry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::events::{ChatInvite, ChatObserver};
use crate::negotiator::{ChatNegotiator, udp_loop};
use crate::session::PrivateSession;

/// Read buffer size for the relay stream.
const READ_BUFFER: usize = 4096;

/// Where the client is in its relay lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    AwaitingWelcome,
    Active,
}

/// Everything that only exists while registered.
struct Link {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    negotiator: ChatNegotiator,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Sockets and leftovers from a successful registration.
struct Registered {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    udp: UdpSocket,
    decoder: FrameDecoder,
    backlog: Vec<Vec<u8>>,
}

/// One participant's connection to the relay.
///
/// Registers over TCP, receives the user list and broadcasts, and listens
/// for peer invites on its own UDP socket.
pub struct RendezvousClient {
    config: ClientConfig,
    observer: Arc<dyn ChatObserver>,
    state: Arc<watch::Sender<ClientState>>,
    link: Option<Link>,
}

impl RendezvousClient {
    pub fn new(config: ClientConfig, observer: Arc<dyn ChatObserver>) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            config,
            observer,
            state: Arc::new(state),
            link: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Receiver that follows every state change.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Registers with the relay.
    ///
    /// Returns once the relay answered. On `WELCOME` the client becomes
    /// active and starts listening on both sockets; on `ERROR` everything is
    /// closed and the reason comes back as [`ClientError::Rejected`].
    pub async fn connect(&mut self) -> ClientResult<()> {
        if self.state() != ClientState::Disconnected {
            return Err(ClientError::Connection("already connected".into()));
        }
        // Leftovers from a link the relay closed on us.
        self.link = None;

        if let Err(e) = self.config.validate() {
            self.observer.on_connect(false, &e.to_string());
            return Err(e);
        }

        self.state.send_replace(ClientState::Connecting);
        let registered = match self.register().await {
            Ok(registered) => registered,
            Err(e) => {
                warn!(error = %e, "Registration failed");
                self.state.send_replace(ClientState::Disconnected);
                self.observer.on_connect(false, &e.to_string());
                return Err(e);
            }
        };

        let Registered {
            reader,
            writer,
            udp,
            decoder,
            backlog,
        } = registered;

        self.state.send_replace(ClientState::Active);
        info!(nick = %self.config.nickname, "Registered with relay");
        self.observer.on_connect(true, &self.config.nickname);

        let udp = Arc::new(udp);
        let negotiator =
            ChatNegotiator::new(&self.config, Arc::clone(&udp), Arc::clone(&self.observer));
        let relay_task = tokio::spawn(relay_loop(
            reader,
            decoder,
            backlog,
            self.config.nickname.clone(),
            Arc::clone(&self.observer),
            Arc::clone(&self.state),
        ));
        let udp_task = tokio::spawn(udp_loop(udp, Arc::clone(&self.observer)));

        self.link = Some(Link {
            writer: Arc::new(Mutex::new(writer)),
            negotiator,
            tasks: vec![relay_task, udp_task],
        });
        Ok(())
    }

    async fn register(&self) -> ClientResult<Registered> {
        let addr = self.config.server_addr.as_str();
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(format!("connecting to {addr}")))?
            .map_err(|e| ClientError::Connection(format!("failed to connect to {addr}: {e}")))?;

        let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let udp_port = udp.local_addr()?.port();
        debug!(%addr, udp_port, "Connected, registering");

        self.state.send_replace(ClientState::AwaitingWelcome);
        let (mut reader, mut writer) = stream.into_split();
        let register = Command::register(self.config.nickname.as_str(), udp_port.to_string());
        writer.write_all(&register.encode()?).await?;

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; READ_BUFFER];
        let (answer, backlog) = 'answer: loop {
            let read = tokio::time::timeout(self.config.connect_timeout, reader.read(&mut buf))
                .await
                .map_err(|_| ClientError::Timeout("waiting for the relay to answer".into()))??;
            if read == 0 {
                return Err(ClientError::Connection(
                    "relay closed the connection before answering".into(),
                ));
            }

            let mut frames = decoder.push(&buf[..read])?.into_iter();
            while let Some(frame) = frames.next() {
                if let Some(command) = Command::from_payload(&frame)? {
                    break 'answer (command, frames.collect::<Vec<_>>());
                }
            }
        };

        match answer {
            Command::Welcome { .. } => Ok(Registered {
                reader,
                writer,
                udp,
                decoder,
                backlog,
            }),
            Command::Error { reason } => Err(ClientError::Rejected(reason)),
            other => Err(ClientError::Protocol(format!(
                "expected WELCOME, got {}",
                other.name()
            ))),
        }
    }

    fn link(&self) -> ClientResult<&Link> {
        match &self.link {
            Some(link) if self.state() == ClientState::Active => Ok(link),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Sends a chat message to everyone else. Blank text is ignored.
    pub async fn send_broadcast(&self, message: &str) -> ClientResult<()> {
        let link = self.link()?;
        let message = message.trim();
        if message.is_empty() {
            return Ok(());
        }

        let frame = Command::broadcast(self.config.nickname.as_str(), message).encode()?;
        link.writer.lock().await.write_all(&frame).await?;
        Ok(())
    }

    /// Handle for sending and answering invites.
    pub fn negotiator(&self) -> ClientResult<ChatNegotiator> {
        Ok(self.link()?.negotiator.clone())
    }

    /// Invites the participant listening on `target` to a private chat.
    pub async fn send_chat_request(&self, target: SocketAddr) -> ClientResult<u16> {
        self.link()?.negotiator.send_chat_request(target).await
    }

    /// Invites a participant from the user list.
    pub async fn invite_user(&self, user: &UserEntry) -> ClientResult<u16> {
        self.link()?.negotiator.invite_user(user).await
    }

    pub async fn accept_invite(&self, invite: ChatInvite) -> ClientResult<PrivateSession> {
        self.link()?.negotiator.accept_invite(invite).await
    }

    pub async fn reject_invite(&self, invite: ChatInvite) -> ClientResult<()> {
        self.link()?.negotiator.reject_invite(invite).await;
        Ok(())
    }

    /// UDP port announced to the relay, while registered.
    pub fn udp_port(&self) -> Option<u16> {
        self.link()
            .ok()
            .and_then(|link| link.negotiator.udp_port().ok())
    }

    /// Leaves the relay.
    ///
    /// Sends `QUIT` if the link is still up, closes both sockets and fires
    /// [`ChatObserver::on_disconnect`]. Does nothing when already
    /// disconnected.
    pub async fn disconnect(&mut self) {
        let previous = self.state.send_replace(ClientState::Disconnected);
        let Some(link) = self.link.take() else {
            return;
        };
        if previous != ClientState::Active {
            return;
        }

        {
            let mut writer = link.writer.lock().await;
            match Command::Quit.encode() {
                Ok(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        debug!(error = %e, "Could not send QUIT");
                    }
                }
                Err(e) => debug!(error = %e, "Could not encode QUIT"),
            }
            let _ = writer.shutdown().await;
        }
        drop(link);

        info!("Disconnected from relay");
        self.observer.on_disconnect();
    }
}

async fn relay_loop(
    mut reader: OwnedReadHalf,
    mut decoder: FrameDecoder,
    backlog: Vec<Vec<u8>>,
    own_nick: String,
    observer: Arc<dyn ChatObserver>,
    state: Arc<watch::Sender<ClientState>>,
) {
    for frame in backlog {
        dispatch(&frame, &own_nick, observer.as_ref());
    }

    let mut buf = [0u8; READ_BUFFER];
    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Relay closed the connection");
                break;
            }
            Ok(read) => read,
            Err(e) => {
                debug!(error = %e, "Relay read failed");
                break;
            }
        };

        match decoder.push(&buf[..read]) {
            Ok(frames) => {
                for frame in frames {
                    dispatch(&frame, &own_nick, observer.as_ref());
                }
            }
            Err(e) => {
                warn!(error = %e, "Relay stream is corrupt");
                break;
            }
        }
    }

    let lost = state.send_if_modified(|current| {
        if *current == ClientState::Active {
            *current = ClientState::Disconnected;
            true
        } else {
            false
        }
    });
    if lost {
        info!("Connection to relay lost");
        observer.on_log("Connection to the server was lost.");
        observer.on_disconnect();
    }
}

fn dispatch(frame: &[u8], own_nick: &str, observer: &dyn ChatObserver) {
    let command = match Command::from_payload(frame) {
        Ok(Some(command)) => command,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed relay message");
            observer.on_log(&format!("Invalid message from server: {e}"));
            return;
        }
    };

    match command {
        Command::UserList(users) => {
            let others = users.into_iter().filter(|user| user.nick != own_nick).collect();
            observer.on_tcp_command(&Command::UserList(others));
        }
        Command::UserJoined(ref user) if user.nick == own_nick => {}
        other => observer.on_tcp_command(&other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelObserver, ChatEvent};

    #[test]
    fn own_nick_is_filtered_from_user_list() {
        let (observer, mut rx) = ChannelObserver::new();
        let frame = Command::UserList(vec![
            UserEntry::new("alice", "127.0.0.1", "4000"),
            UserEntry::new("bob", "127.0.0.1", "4001"),
        ])
        .to_payload();

        dispatch(frame.as_bytes(), "alice", &observer);

        match rx.try_recv() {
            Ok(ChatEvent::Relay(Command::UserList(users))) => {
                assert_eq!(users, vec![UserEntry::new("bob", "127.0.0.1", "4001")]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn own_join_is_not_reported() {
        let (observer, mut rx) = ChannelObserver::new();
        let own = Command::UserJoined(UserEntry::new("alice", "127.0.0.1", "4000")).to_payload();
        let other = Command::UserJoined(UserEntry::new("bob", "127.0.0.1", "4001")).to_payload();

        dispatch(own.as_bytes(), "alice", &observer);
        dispatch(other.as_bytes(), "alice", &observer);

        assert!(matches!(
            rx.try_recv(),
            Ok(ChatEvent::Relay(Command::UserJoined(ref user))) if user.nick == "bob"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_relay_message_is_logged() {
        let (observer, mut rx) = ChannelObserver::new();
        dispatch(b"USER_JOINED bob", "alice", &observer);
        dispatch(b"   ", "alice", &observer);
        assert!(matches!(rx.try_recv(), Ok(ChatEvent::Log(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn operations_need_a_connection() {
        let (observer, _rx) = ChannelObserver::new();
        let client = RendezvousClient::new(
            ClientConfig::new("127.0.0.1:9", "alice"),
            Arc::new(observer),
        );
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(matches!(
            client.send_broadcast("hi").await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(client.negotiator(), Err(ClientError::NotConnected)));
        assert!(client.udp_port().is_none());
    }

    #[tokio::test]
    async fn invalid_nickname_fails_before_connecting() {
        let (observer, mut rx) = ChannelObserver::new();
        let mut client =
            RendezvousClient::new(ClientConfig::new("127.0.0.1:9", "two words"), Arc::new(observer));
        assert!(matches!(client.connect().await, Err(ClientError::Config(_))));
        assert!(matches!(
            rx.try_recv(),
            Ok(ChatEvent::Connected { success: false, .. })
        ));
        assert_eq!(client.state(), ClientState::Disconnected);
    }
}
