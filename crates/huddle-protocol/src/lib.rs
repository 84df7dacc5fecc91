//! Wire protocol for the huddle relay chat.
//!
//! # Protocol Overview
//!
//! Messages are sent as length-prefixed UTF-8 text:
//! - 4 bytes: payload length (u32, big-endian)
//! - N bytes: `COMMAND arg1 arg2 ... argN`
//!
//! TCP connections to the relay carry a stream of such frames; each UDP
//! datagram between peers carries exactly one.
//!
//! # Example
//!
//! ```rust
//! use huddle_protocol::{Command, FrameDecoder};
//!
//! let bytes = Command::register("alice", "40001").encode().unwrap();
//!
//! let mut decoder = FrameDecoder::new();
//! let frames = decoder.push(&bytes).unwrap();
//! let command = Command::from_payload(&frames[0]).unwrap();
//! assert_eq!(command, Some(Command::register("alice", "40001")));
//! ```

mod command;
mod error;
mod framing;

pub use command::{Command, UserEntry, extract_command};
pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FrameDecoder, decode_datagram, decode_stream, encode_frame};

/// Maximum frame payload size (1 MB).
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Literal line that ends a private session.
pub const DISCONNECT_SENTINEL: &str = "[DISCONNECT]";
