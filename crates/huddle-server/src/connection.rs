//! Per-connection worker.
//!
//! Each accepted socket is split into a reader, which decodes frames and
//! dispatches commands in arrival order, and a writer, which drains the
//! connection's outbound queue. Other connections only ever touch the queue.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

use huddle_protocol::{Command, FrameDecoder, UserEntry, extract_command};

use crate::registry::{ClientEntry, ConnectionHandle, ConnectionId, Registry};

/// Reason sent when a nickname is already registered.
pub const NICKNAME_TAKEN: &str = "Nickname already taken";

/// Reason sent when a client connects over IPv6. Roster entries are
/// `nick:ip:port`, which has no room for an IPv6 address.
pub const IPV6_UNSUPPORTED: &str = "IPv6 clients are not supported";

const READ_CHUNK: usize = 4096;

/// Lifecycle of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Accepted, worker not yet reading.
    Connecting,
    /// Waiting for a valid `REGISTER`.
    Registering,
    /// Nickname registered.
    Active,
    /// Loop finished, cleaning up.
    Closing,
    /// Done.
    Closed,
}

enum Flow {
    Continue,
    Close,
}

/// Runs one client connection to completion.
pub(crate) async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    registry: Arc<Registry>,
    max_frame_size: u32,
    outbound_capacity: usize,
) {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(outbound_capacity);
    let outbound = ConnectionHandle::new(id, tx);
    let eviction = outbound.eviction();

    let worker = ClientConnection {
        id,
        peer,
        registry,
        eviction: outbound.eviction(),
        outbound,
        nick: None,
        phase: ConnectionPhase::Connecting,
    };

    tokio::join!(
        worker.run(reader, max_frame_size),
        write_loop(writer, rx, eviction)
    );
}

/// Writes queued commands until every handle to the queue is dropped, or
/// stops at once if the connection is evicted.
async fn write_loop(
    writer: OwnedWriteHalf,
    rx: mpsc::Receiver<Command>,
    mut eviction: watch::Receiver<bool>,
) {
    tokio::select! {
        () = drain(writer, rx) => {}
        Ok(_) = eviction.wait_for(|evicted| *evicted) => {
            debug!("Writer stopped, connection evicted");
        }
    }
}

async fn drain(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        let bytes = match command.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, command = command.name(), "Dropping unencodable command");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&bytes).await {
            debug!(error = %e, "Write failed, stopping writer");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

struct ClientConnection {
    id: ConnectionId,
    peer: SocketAddr,
    registry: Arc<Registry>,
    outbound: ConnectionHandle,
    eviction: watch::Receiver<bool>,
    nick: Option<String>,
    phase: ConnectionPhase,
}

impl ClientConnection {
    async fn run(mut self, mut reader: OwnedReadHalf, max_frame_size: u32) {
        self.transition(ConnectionPhase::Registering);

        let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
        let mut buf = vec![0u8; READ_CHUNK];

        'read: loop {
            let read = tokio::select! {
                read = reader.read(&mut buf) => read,
                Ok(_) = self.eviction.wait_for(|evicted| *evicted) => {
                    info!(peer = %self.peer, "Closing evicted connection");
                    break;
                }
            };
            let n = match read {
                Ok(0) => {
                    debug!("Peer closed connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Read failed");
                    break;
                }
            };

            let frames = match decoder.push(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(error = %e, "Unrecoverable framing error");
                    self.reply(Command::error(e.to_string()));
                    break;
                }
            };

            for payload in frames {
                if let Flow::Close = self.dispatch(&payload).await {
                    break 'read;
                }
            }
        }

        self.finish().await;
    }

    async fn dispatch(&mut self, payload: &[u8]) -> Flow {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Frame is not valid UTF-8");
                self.reply(Command::error("payload is not valid UTF-8"));
                return Flow::Continue;
            }
        };

        let Some((name, args)) = extract_command(text) else {
            return Flow::Continue;
        };

        let command = match Command::from_parts(name, &args) {
            Ok(command) => command,
            Err(huddle_protocol::ProtocolError::UnknownCommand { name }) => {
                warn!(command = %name, "Ignoring unknown command");
                return Flow::Continue;
            }
            Err(e) => {
                warn!(error = %e, "Malformed command");
                self.reply(Command::error(e.to_string()));
                // A broken REGISTER ends the attempt.
                if name == "REGISTER" && self.nick.is_none() {
                    return Flow::Close;
                }
                return Flow::Continue;
            }
        };

        match command {
            Command::Register { nick, udp_port } => self.register(nick, udp_port).await,
            Command::Broadcast { sender, message } => {
                self.broadcast(&sender, &message).await;
                Flow::Continue
            }
            Command::Quit => {
                debug!("Client sent QUIT");
                Flow::Close
            }
            other => {
                warn!(command = other.name(), "Ignoring server-to-client command");
                Flow::Continue
            }
        }
    }

    async fn register(&mut self, nick: String, udp_port: String) -> Flow {
        if self.nick.is_some() {
            self.reply(Command::error("already registered"));
            return Flow::Continue;
        }

        let ip = match self.peer.ip().to_canonical() {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => {
                warn!(nick = %nick, ip = %ip, "Refusing IPv6 client");
                self.reply(Command::error(IPV6_UNSUPPORTED));
                return Flow::Close;
            }
        };
        let entry = ClientEntry::new(self.outbound.clone(), ip.clone(), udp_port.clone());

        let greeting = Command::welcome(nick.clone());
        let joined = Command::UserJoined(UserEntry::new(nick.clone(), ip.clone(), udp_port.clone()));
        let admitted = self
            .registry
            .try_register_with(&nick, entry, |admission| {
                admission.entry.connection.send(greeting);
                admission
                    .entry
                    .connection
                    .send(Command::UserList(admission.roster));
                for other in &admission.others {
                    other.send(joined.clone());
                }
            })
            .await;

        if !admitted {
            info!(nick = %nick, "Rejecting duplicate nickname");
            self.reply(Command::error(NICKNAME_TAKEN));
            return Flow::Close;
        }

        info!(nick = %nick, ip = %ip, udp_port = %udp_port, "Client registered");
        self.nick = Some(nick);
        self.transition(ConnectionPhase::Active);
        Flow::Continue
    }

    async fn broadcast(&self, claimed_sender: &str, message: &str) {
        let Some(nick) = self.nick.as_deref() else {
            self.reply(Command::error("not registered"));
            return;
        };

        if claimed_sender != nick {
            warn!(nick, claimed = claimed_sender, "Broadcast sender does not match registration");
        }

        let message: String = message.nfc().collect();
        debug!(nick, message = %message, "Relaying broadcast");
        self.fan_out(Command::broadcast(nick, message)).await;
    }

    /// Pushes `command` to every other registered client.
    ///
    /// Recipients are copied out of the registry first. A closed or evicted
    /// recipient is skipped and never reported back to this connection.
    async fn fan_out(&self, command: Command) {
        let recipients = self.registry.recipients_except(self.id).await;
        for recipient in recipients {
            if !recipient.send(command.clone()) {
                debug!(recipient = recipient.id(), "Recipient already gone");
            }
        }
    }

    fn reply(&self, command: Command) {
        self.outbound.send(command);
    }

    async fn finish(mut self) {
        self.transition(ConnectionPhase::Closing);

        if let Some(nick) = self.nick.take() {
            let left = Command::user_left(nick.clone());
            let removed = self
                .registry
                .remove_if_owner_with(&nick, self.id, |others| {
                    for other in others {
                        other.send(left.clone());
                    }
                })
                .await;
            if removed {
                info!(nick = %nick, "Client left");
            }
        }

        self.transition(ConnectionPhase::Closed);
    }

    fn transition(&mut self, phase: ConnectionPhase) {
        debug!(from = ?self.phase, to = ?phase, peer = %self.peer, "Connection phase");
        self.phase = phase;
    }
}
