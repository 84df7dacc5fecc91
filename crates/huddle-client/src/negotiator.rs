//! Peer-to-peer chat invites over UDP.
//!
//! The inviter opens an ephemeral TCP listener and sends `CHAT_REQUEST <port>`
//! to the invitee's UDP endpoint. The invitee either connects to that port or
//! answers `CHAT_REJECTED`. Either way the relay is not involved.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use huddle_protocol::{Command, UserEntry, decode_datagram};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::events::{ChatInvite, ChatObserver};
use crate::session::PrivateSession;

/// Largest datagram the UDP loop accepts.
const DATAGRAM_BUFFER: usize = 2048;

/// Sends, accepts and rejects private chat invites.
///
/// Cheap to clone; clones share the UDP socket.
#[derive(Clone)]
pub struct ChatNegotiator {
    nickname: Arc<str>,
    udp: Arc<UdpSocket>,
    observer: Arc<dyn ChatObserver>,
    connect_timeout: Duration,
    invite_timeout: Duration,
    handshake_timeout: Duration,
}

impl ChatNegotiator {
    pub(crate) fn new(
        config: &ClientConfig,
        udp: Arc<UdpSocket>,
        observer: Arc<dyn ChatObserver>,
    ) -> Self {
        Self {
            nickname: Arc::from(config.nickname.as_str()),
            udp,
            observer,
            connect_timeout: config.connect_timeout,
            invite_timeout: config.invite_timeout,
            handshake_timeout: config.handshake_timeout,
        }
    }

    /// Port the UDP socket is bound to.
    pub fn udp_port(&self) -> ClientResult<u16> {
        Ok(self.udp.local_addr()?.port())
    }

    /// Invites the participant whose UDP endpoint is `target`.
    ///
    /// Returns the TCP port the invitee is expected to connect to. The accept
    /// runs in the background for at most the invite timeout; a successful
    /// connection is handed over through
    /// [`ChatObserver::on_private_chat`].
    pub async fn send_chat_request(&self, target: SocketAddr) -> ClientResult<u16> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let tcp_port = listener.local_addr()?.port();
        let datagram = Command::ChatRequest { tcp_port }.encode()?;

        if let Err(e) = self.udp.send_to(&datagram, target).await {
            warn!(%target, error = %e, "Failed to send chat request");
            self.observer
                .on_log(&format!("Could not send chat request to {target}: {e}"));
            return Err(e.into());
        }

        info!(%target, tcp_port, "Chat request sent");
        self.observer
            .on_log(&format!("Chat request sent to {target}, waiting for an answer"));

        let this = self.clone();
        tokio::spawn(async move { this.await_invitee(listener).await });
        Ok(tcp_port)
    }

    /// Invites a participant from the relay's user list.
    pub async fn invite_user(&self, user: &UserEntry) -> ClientResult<u16> {
        let target = udp_endpoint(user)?;
        self.send_chat_request(target).await
    }

    /// Connects to the inviter and opens the private session.
    pub async fn accept_invite(&self, invite: ChatInvite) -> ClientResult<PrivateSession> {
        let endpoint = invite.endpoint();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| ClientError::Timeout(format!("connecting to {endpoint}")))?
            .map_err(|e| ClientError::Connection(format!("failed to reach {endpoint}: {e}")))?;

        info!(%endpoint, "Accepted chat invite");
        PrivateSession::negotiate(stream, &self.nickname, self.handshake_timeout).await
    }

    /// Declines an invite with a single `CHAT_REJECTED` datagram.
    ///
    /// Best effort: a failed send is logged, never returned.
    pub async fn reject_invite(&self, invite: ChatInvite) {
        let target = invite.from;
        let sent = match Command::ChatRejected.encode() {
            Ok(datagram) => self.udp.send_to(&datagram, target).await.map(drop),
            Err(e) => Err(std::io::Error::new(ErrorKind::InvalidData, e.to_string())),
        };
        match sent {
            Ok(()) => debug!(%target, "Chat invite rejected"),
            Err(e) => {
                warn!(%target, error = %e, "Failed to send CHAT_REJECTED");
                self.observer
                    .on_log(&format!("Could not notify {target} of the rejection: {e}"));
            }
        }
    }

    async fn await_invitee(self, listener: TcpListener) {
        let accepted = tokio::time::timeout(self.invite_timeout, listener.accept()).await;
        drop(listener);

        match accepted {
            Ok(Ok((stream, peer))) => {
                match PrivateSession::negotiate(stream, &self.nickname, self.handshake_timeout)
                    .await
                {
                    Ok(session) => self.observer.on_private_chat(session),
                    Err(e) => {
                        warn!(%peer, error = %e, "Private chat handshake failed");
                        self.observer
                            .on_log(&format!("Private chat with {peer} failed: {e}"));
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Accepting the invitee failed");
                self.observer.on_log(&format!("Chat request failed: {e}"));
            }
            Err(_) => {
                info!("Chat request expired");
                self.observer.on_log("Your chat request was not answered.");
            }
        }
    }
}

/// Reads datagrams until the socket fails, dispatching invites and other
/// peer commands to the observer.
pub(crate) async fn udp_loop(udp: Arc<UdpSocket>, observer: Arc<dyn ChatObserver>) {
    let mut buf = vec![0u8; DATAGRAM_BUFFER];

    loop {
        let (len, from) = match udp.recv_from(&mut buf).await {
            Ok(received) => received,
            // ICMP port-unreachable from an earlier send surfaces here on some
            // platforms.
            Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
            Err(e) => {
                debug!(error = %e, "UDP listener stopped");
                break;
            }
        };

        let command = match decode_datagram(&buf[..len]).and_then(Command::from_payload) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!(%from, error = %e, "Dropping malformed datagram");
                observer.on_log(&format!("Invalid UDP message from {from}: {e}"));
                continue;
            }
        };

        match command {
            Command::ChatRequest { tcp_port } => {
                info!(%from, tcp_port, "Chat request received");
                observer.on_chat_request(ChatInvite { from, tcp_port });
            }
            Command::ChatRejected => {
                info!(%from, "Chat request declined");
                observer.on_log(&format!("{from} declined your chat request."));
                observer.on_udp_command(&command, from);
            }
            other => {
                debug!(%from, command = other.name(), "Datagram received");
                observer.on_udp_command(&other, from);
            }
        }
    }
}

fn udp_endpoint(user: &UserEntry) -> ClientResult<SocketAddr> {
    let ip: IpAddr = user
        .ip
        .parse()
        .map_err(|_| ClientError::Protocol(format!("invalid user list entry: {user}")))?;
    let port: u16 = user
        .udp_port
        .parse()
        .map_err(|_| ClientError::Protocol(format!("invalid user list entry: {user}")))?;
    Ok(SocketAddr::new(ip, port))
}
