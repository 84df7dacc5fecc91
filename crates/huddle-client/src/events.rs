//! Notifications from the client to the application.

use std::net::SocketAddr;

use huddle_protocol::Command;
use tokio::sync::mpsc;

use crate::session::PrivateSession;

/// An incoming invitation to a private chat.
///
/// Consumed by exactly one of
/// [`ChatNegotiator::accept_invite`](crate::ChatNegotiator::accept_invite) or
/// [`ChatNegotiator::reject_invite`](crate::ChatNegotiator::reject_invite).
#[derive(Debug, PartialEq, Eq)]
pub struct ChatInvite {
    pub(crate) from: SocketAddr,
    pub(crate) tcp_port: u16,
}

impl ChatInvite {
    /// UDP address the invite came from.
    pub fn from(&self) -> SocketAddr {
        self.from
    }

    /// Port the inviter is listening on.
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Where to connect to accept the invite.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.from.ip(), self.tcp_port)
    }
}

/// Callbacks the client fires as things happen.
///
/// Every method has an empty default so implementations only override what
/// they care about. Callbacks run on the client's background tasks and
/// should not block.
pub trait ChatObserver: Send + Sync + 'static {
    /// Registration finished; `info` is the nickname or the failure reason.
    fn on_connect(&self, _success: bool, _info: &str) {}

    /// The relay link is gone.
    fn on_disconnect(&self) {}

    /// A command arrived from the relay.
    fn on_tcp_command(&self, _command: &Command) {}

    /// A datagram from a peer that is not an invite.
    fn on_udp_command(&self, _command: &Command, _from: SocketAddr) {}

    /// A peer wants to chat privately.
    fn on_chat_request(&self, _invite: ChatInvite) {}

    /// A private session is ready.
    fn on_private_chat(&self, _session: PrivateSession) {}

    /// Human readable status text.
    fn on_log(&self, _text: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ChatObserver for NoopObserver {}

/// Observer callbacks turned into values.
#[derive(Debug)]
pub enum ChatEvent {
    Connected { success: bool, info: String },
    Disconnected,
    Relay(Command),
    Datagram { command: Command, from: SocketAddr },
    ChatRequest(ChatInvite),
    PrivateChat(PrivateSession),
    Log(String),
}

/// Forwards every callback into a channel so an async consumer can
/// `recv().await` them in order.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: ChatEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl ChatObserver for ChannelObserver {
    fn on_connect(&self, success: bool, info: &str) {
        self.emit(ChatEvent::Connected {
            success,
            info: info.to_string(),
        });
    }

    fn on_disconnect(&self) {
        self.emit(ChatEvent::Disconnected);
    }

    fn on_tcp_command(&self, command: &Command) {
        self.emit(ChatEvent::Relay(command.clone()));
    }

    fn on_udp_command(&self, command: &Command, from: SocketAddr) {
        self.emit(ChatEvent::Datagram {
            command: command.clone(),
            from,
        });
    }

    fn on_chat_request(&self, invite: ChatInvite) {
        self.emit(ChatEvent::ChatRequest(invite));
    }

    fn on_private_chat(&self, session: PrivateSession) {
        self.emit(ChatEvent::PrivateChat(session));
    }

    fn on_log(&self, text: &str) {
        self.emit(ChatEvent::Log(text.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_endpoint_uses_sender_ip() {
        let invite = ChatInvite {
            from: "10.0.0.7:40000".parse().unwrap(),
            tcp_port: 52000,
        };
        assert_eq!(invite.endpoint(), "10.0.0.7:52000".parse().unwrap());
        assert_eq!(invite.tcp_port(), 52000);
    }

    #[test]
    fn channel_observer_preserves_order() {
        let (observer, mut rx) = ChannelObserver::new();
        observer.on_connect(true, "alice");
        observer.on_tcp_command(&Command::welcome("alice"));
        observer.on_log("hello");
        observer.on_disconnect();

        assert!(matches!(
            rx.try_recv(),
            Ok(ChatEvent::Connected { success: true, ref info }) if info == "alice"
        ));
        assert!(matches!(rx.try_recv(), Ok(ChatEvent::Relay(Command::Welcome { .. }))));
        assert!(matches!(rx.try_recv(), Ok(ChatEvent::Log(ref text)) if text == "hello"));
        assert!(matches!(rx.try_recv(), Ok(ChatEvent::Disconnected)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.on_log("nobody hears this");
    }
}
