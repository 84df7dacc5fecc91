//! Typed commands carried inside frames.
//!
//! A payload is a space-joined `NAME arg1 arg2 ... argN`. No escaping is
//! performed: every argument is a single word, except the trailing message of
//! `BROADCAST` and the reason of `ERROR`, which take the remaining words
//! rejoined with single spaces.

use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, ProtocolResult};
use crate::framing::encode_frame;

/// One registered participant as announced by the relay: `nick:ip:udp_port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserEntry {
    /// Registered nickname.
    pub nick: String,
    /// Address the relay saw the participant connect from.
    pub ip: String,
    /// UDP port announced by the participant, kept verbatim.
    pub udp_port: String,
}

impl UserEntry {
    /// Creates a new entry.
    pub fn new(nick: impl Into<String>, ip: impl Into<String>, udp_port: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            ip: ip.into(),
            udp_port: udp_port.into(),
        }
    }
}

impl fmt::Display for UserEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.nick, self.ip, self.udp_port)
    }
}

impl FromStr for UserEntry {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [nick, ip, udp_port] => Ok(Self::new(*nick, *ip, *udp_port)),
            _ => Err(ProtocolError::invalid_argument(
                "USERLIST",
                format!("invalid entry: {s}"),
            )),
        }
    }
}

/// Protocol commands exchanged between clients, the relay and peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Client asks to join under `nick`, announcing its UDP port.
    Register { nick: String, udp_port: String },
    /// Registration accepted.
    Welcome { nick: String },
    /// Something went wrong; `reason` is human-readable.
    Error { reason: String },
    /// Chat message for everyone else. Relayed verbatim to other clients.
    Broadcast { sender: String, message: String },
    /// Everyone currently registered.
    UserList(Vec<UserEntry>),
    /// A participant registered.
    UserJoined(UserEntry),
    /// A participant went away.
    UserLeft { nick: String },
    /// Client is leaving.
    Quit,
    /// UDP invite: "connect to me on this TCP port".
    ChatRequest { tcp_port: u16 },
    /// UDP answer to a declined invite.
    ChatRejected,
}

/// Splits a payload into its command name and arguments.
///
/// Returns `None` for a blank payload; callers ignore such frames.
pub fn extract_command(payload: &str) -> Option<(&str, Vec<&str>)> {
    let mut words = payload.split_whitespace();
    let name = words.next()?;
    Some((name, words.collect()))
}

fn expect_args(
    command: &'static str,
    expected: &'static str,
    args: &[&str],
    count: usize,
) -> ProtocolResult<()> {
    if args.len() == count {
        Ok(())
    } else {
        Err(ProtocolError::arity(command, expected, args.len()))
    }
}

fn read_register(args: &[&str]) -> ProtocolResult<Command> {
    expect_args("REGISTER", "2 arguments (nickname, udp_port)", args, 2)?;
    if args[0].contains(':') {
        return Err(ProtocolError::invalid_argument(
            "REGISTER",
            "nickname must not contain ':'",
        ));
    }
    Ok(Command::register(args[0], args[1]))
}

fn read_broadcast(args: &[&str]) -> ProtocolResult<Command> {
    match args {
        [sender, message @ ..] if !message.is_empty() => {
            Ok(Command::broadcast(*sender, message.join(" ")))
        }
        _ => Err(ProtocolError::arity(
            "BROADCAST",
            "at least 2 arguments (sender, message)",
            args.len(),
        )),
    }
}

fn read_user_joined(args: &[&str]) -> ProtocolResult<Command> {
    expect_args("USER_JOINED", "3 arguments (nick, ip, udp_port)", args, 3)?;
    Ok(Command::UserJoined(UserEntry::new(args[0], args[1], args[2])))
}

fn read_chat_request(args: &[&str]) -> ProtocolResult<Command> {
    expect_args("CHAT_REQUEST", "1 argument (port)", args, 1)?;
    let tcp_port: u16 = args[0].parse().map_err(|_| {
        ProtocolError::invalid_argument("CHAT_REQUEST", format!("invalid port: {}", args[0]))
    })?;
    if tcp_port == 0 {
        return Err(ProtocolError::invalid_argument(
            "CHAT_REQUEST",
            "port must be non-zero",
        ));
    }
    Ok(Command::ChatRequest { tcp_port })
}

impl Command {
    /// Creates a REGISTER command.
    pub fn register(nick: impl Into<String>, udp_port: impl Into<String>) -> Self {
        Self::Register {
            nick: nick.into(),
            udp_port: udp_port.into(),
        }
    }

    /// Creates a WELCOME command.
    pub fn welcome(nick: impl Into<String>) -> Self {
        Self::Welcome { nick: nick.into() }
    }

    /// Creates an ERROR command.
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
        }
    }

    /// Creates a BROADCAST command.
    pub fn broadcast(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Broadcast {
            sender: sender.into(),
            message: message.into(),
        }
    }

    /// Creates a USER_LEFT command.
    pub fn user_left(nick: impl Into<String>) -> Self {
        Self::UserLeft { nick: nick.into() }
    }

    /// Returns the wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "REGISTER",
            Self::Welcome { .. } => "WELCOME",
            Self::Error { .. } => "ERROR",
            Self::Broadcast { .. } => "BROADCAST",
            Self::UserList(_) => "USERLIST",
            Self::UserJoined(_) => "USER_JOINED",
            Self::UserLeft { .. } => "USER_LEFT",
            Self::Quit => "QUIT",
            Self::ChatRequest { .. } => "CHAT_REQUEST",
            Self::ChatRejected => "CHAT_REJECTED",
        }
    }

    /// Validates a command name and its arguments.
    pub fn from_parts(name: &str, args: &[&str]) -> ProtocolResult<Self> {
        match name {
            "REGISTER" => read_register(args),
            "WELCOME" => {
                expect_args("WELCOME", "1 argument (nickname)", args, 1)?;
                Ok(Self::welcome(args[0]))
            }
            "ERROR" => Ok(Self::error(args.join(" "))),
            "BROADCAST" => read_broadcast(args),
            "USERLIST" => args
                .iter()
                .map(|entry| entry.parse())
                .collect::<ProtocolResult<Vec<UserEntry>>>()
                .map(Self::UserList),
            "USER_JOINED" => read_user_joined(args),
            "USER_LEFT" => {
                expect_args("USER_LEFT", "1 argument (nickname)", args, 1)?;
                Ok(Self::user_left(args[0]))
            }
            "QUIT" => {
                expect_args("QUIT", "no arguments", args, 0)?;
                Ok(Self::Quit)
            }
            "CHAT_REQUEST" => read_chat_request(args),
            "CHAT_REJECTED" => {
                expect_args("CHAT_REJECTED", "no arguments", args, 0)?;
                Ok(Self::ChatRejected)
            }
            other => Err(ProtocolError::UnknownCommand {
                name: other.to_string(),
            }),
        }
    }

    /// Parses a text payload. Blank payloads yield `Ok(None)`.
    pub fn parse(payload: &str) -> ProtocolResult<Option<Self>> {
        match extract_command(payload) {
            Some((name, args)) => Self::from_parts(name, &args).map(Some),
            None => Ok(None),
        }
    }

    /// Parses a raw frame payload.
    pub fn from_payload(payload: &[u8]) -> ProtocolResult<Option<Self>> {
        Self::parse(std::str::from_utf8(payload)?)
    }

    /// Renders the space-joined payload.
    pub fn to_payload(&self) -> String {
        let args: Vec<String> = match self {
            Self::Register { nick, udp_port } => vec![nick.clone(), udp_port.clone()],
            Self::Welcome { nick } | Self::UserLeft { nick } => vec![nick.clone()],
            Self::Error { reason } => vec![reason.clone()],
            Self::Broadcast { sender, message } => vec![sender.clone(), message.clone()],
            Self::UserList(entries) => entries.iter().map(ToString::to_string).collect(),
            Self::UserJoined(entry) => {
                vec![entry.nick.clone(), entry.ip.clone(), entry.udp_port.clone()]
            }
            Self::ChatRequest { tcp_port } => vec![tcp_port.to_string()],
            Self::Quit | Self::ChatRejected => Vec::new(),
        };

        std::iter::once(self.name())
            .chain(args.iter().map(String::as_str).filter(|a| !a.is_empty()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Encodes the command into a length-prefixed frame.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_frame(&self.to_payload())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_payload())
    }
}
