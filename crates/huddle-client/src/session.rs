//! Direct peer-to-peer chat over a single TCP stream.
//!
//! The stream carries newline-terminated UTF-8 lines. The first line each
//! side writes is its own nickname; every later line is one chat message,
//! except [`DISCONNECT_SENTINEL`] which announces that the peer is leaving.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use huddle_protocol::DISCONNECT_SENTINEL;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{ClientError, ClientResult};

/// Lifecycle of a private session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Exchanging nicknames.
    Negotiating,
    /// Messages flow both ways.
    Active,
    /// Local close in progress.
    Closing,
    /// Stream released.
    Closed,
}

/// Something that happened on the peer's side of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chat line from the peer.
    Message {
        from: String,
        text: String,
        at: DateTime<Local>,
    },
    /// The peer sent the disconnect sentinel.
    PeerLeft,
    /// The stream ended without the sentinel.
    Disconnected,
}

/// Who is on either end of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub local_nick: String,
    pub peer_nick: String,
    pub peer_addr: SocketAddr,
}

type SharedWriter = Arc<Mutex<Option<OwnedWriteHalf>>>;

/// An established private chat with one peer.
///
/// Both the inviter and the invitee end up holding one of these. Dropping it
/// releases the stream without telling the peer; call [`close`](Self::close)
/// for an orderly goodbye.
pub struct PrivateSession {
    info: SessionInfo,
    writer: SharedWriter,
    phase: Arc<watch::Sender<SessionPhase>>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    reader: JoinHandle<()>,
}

impl PrivateSession {
    /// Runs the nickname exchange on a freshly connected stream and starts
    /// listening for the peer's messages.
    pub async fn negotiate(
        stream: TcpStream,
        local_nick: &str,
        handshake_timeout: Duration,
    ) -> ClientResult<Self> {
        let peer_addr = stream.peer_addr()?;
        let (phase, _) = watch::channel(SessionPhase::Negotiating);
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let exchange = async {
            write_half
                .write_all(format!("{local_nick}\n").as_bytes())
                .await?;
            let mut line = String::new();
            let read = reader.read_line(&mut line).await?;
            Ok::<_, std::io::Error>((read, line))
        };
        let (read, line) = tokio::time::timeout(handshake_timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(format!("nickname exchange with {peer_addr}")))??;

        let peer_nick = line.trim().to_string();
        if read == 0 || peer_nick.is_empty() {
            return Err(ClientError::Handshake(format!(
                "{peer_addr} closed before sending a nickname"
            )));
        }

        info!(peer = %peer_nick, addr = %peer_addr, "Private session established");
        phase.send_replace(SessionPhase::Active);

        let phase = Arc::new(phase);
        let writer: SharedWriter = Arc::new(Mutex::new(Some(write_half)));
        let (events_tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(receive_loop(
            reader,
            peer_nick.clone(),
            Arc::clone(&writer),
            Arc::clone(&phase),
            events_tx,
        ));

        Ok(Self {
            info: SessionInfo {
                local_nick: local_nick.to_string(),
                peer_nick,
                peer_addr,
            },
            writer,
            phase,
            events,
            reader,
        })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn peer_nick(&self) -> &str {
        &self.info.peer_nick
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Sends one chat line to the peer.
    ///
    /// The stream is line-delimited, so `text` must not contain a line break.
    pub async fn send(&self, text: &str) -> ClientResult<()> {
        if text.contains(['\n', '\r']) {
            return Err(ClientError::Session(
                "message must not contain line breaks".into(),
            ));
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(ClientError::Session("session is closed".into()));
        };

        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            guard.take();
            drop(guard);
            self.phase.send_replace(SessionPhase::Closed);
            return Err(e.into());
        }
        Ok(())
    }

    /// Tells the peer we are leaving and releases the stream.
    ///
    /// Write failures are swallowed; the stream is released either way.
    /// Calling this on a closed session does nothing.
    pub async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            self.phase.send_replace(SessionPhase::Closing);
            let sentinel = format!("{DISCONNECT_SENTINEL}\n");
            if let Err(e) = writer.write_all(sentinel.as_bytes()).await {
                debug!(error = %e, "Could not send disconnect sentinel");
            }
            let _ = writer.shutdown().await;
        }
        self.phase.send_replace(SessionPhase::Closed);
    }

    /// Waits for the next event from the peer.
    ///
    /// Returns `None` once the session has ended and every event was taken.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Waits until the stream has been released.
    pub async fn closed(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == SessionPhase::Closed).await;
    }
}

impl fmt::Debug for PrivateSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateSession")
            .field("info", &self.info)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Drop for PrivateSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn receive_loop(
    reader: BufReader<OwnedReadHalf>,
    peer_nick: String,
    writer: SharedWriter,
    phase: Arc<watch::Sender<SessionPhase>>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut lines = reader.lines();
    let mut phase_rx = phase.subscribe();

    let outcome = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line == DISCONNECT_SENTINEL => {
                    info!(peer = %peer_nick, "Peer left the private chat");
                    break Some(SessionEvent::PeerLeft);
                }
                Ok(Some(text)) => {
                    let _ = events.send(SessionEvent::Message {
                        from: peer_nick.clone(),
                        text,
                        at: Local::now(),
                    });
                }
                Ok(None) => {
                    info!(peer = %peer_nick, "Private chat stream ended");
                    break Some(SessionEvent::Disconnected);
                }
                Err(e) => {
                    debug!(peer = %peer_nick, error = %e, "Private chat read failed");
                    break Some(SessionEvent::Disconnected);
                }
            },
            _ = phase_rx.wait_for(|p| matches!(p, SessionPhase::Closing | SessionPhase::Closed)) => {
                break None;
            }
        }
    };

    // Leaving because the peer went away: release without echoing the sentinel.
    if let Some(event) = outcome {
        if let Some(mut writer) = writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        phase.send_replace(SessionPhase::Closed);
        let _ = events.send(event);
    }
}
