//! Length-prefixed message framing.
//!
//! Every message is framed with a 4-byte big-endian length prefix followed
//! by the UTF-8 payload:
//!
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  |  UTF-8 payload   |
//! +----------------+------------------+
//! ```
//!
//! The same layout is used for TCP streams and for single UDP datagrams.

use crate::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

const PREFIX_LEN: usize = 4;

/// Encodes a payload into a length-prefixed frame.
///
/// # Example
///
/// ```rust
/// use huddle_protocol::encode_frame;
///
/// let bytes = encode_frame("QUIT").unwrap();
/// assert_eq!(&bytes[..4], &[0, 0, 0, 4]);
/// assert_eq!(&bytes[4..], b"QUIT");
/// ```
pub fn encode_frame(payload: &str) -> ProtocolResult<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::MessageTooLarge {
        size: u32::MAX,
        max: MAX_FRAME_SIZE,
    })?;

    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buffer = Vec::with_capacity(PREFIX_LEN + payload.len());
    buffer.extend_from_slice(&len.to_be_bytes());
    buffer.extend_from_slice(payload.as_bytes());
    Ok(buffer)
}

/// Splits a byte buffer into complete frame payloads.
///
/// Returns the payloads in arrival order plus the unconsumed tail (a partial
/// length prefix or a partial payload), which the caller must prepend to the
/// next read. Feeding the same bytes in any chunking yields the same payloads.
///
/// ```rust
/// use huddle_protocol::{decode_stream, encode_frame};
///
/// let mut bytes = encode_frame("WELCOME alice").unwrap();
/// bytes.extend_from_slice(&[0, 0]);
///
/// let (frames, rest) = decode_stream(&bytes);
/// assert_eq!(frames, vec![&b"WELCOME alice"[..]]);
/// assert_eq!(rest, &[0, 0]);
/// ```
pub fn decode_stream(buffer: &[u8]) -> (Vec<&[u8]>, &[u8]) {
    let mut frames = Vec::new();
    let mut offset = 0;

    while let Some(len) = declared_len(&buffer[offset..]) {
        let start = offset + PREFIX_LEN;
        if buffer.len() - start < len {
            break;
        }
        frames.push(&buffer[start..start + len]);
        offset = start + len;
    }

    (frames, &buffer[offset..])
}

/// Decodes the payload of a single UDP datagram.
///
/// Bytes past the declared payload are ignored.
pub fn decode_datagram(data: &[u8]) -> ProtocolResult<&[u8]> {
    let len = declared_len(data).ok_or(ProtocolError::IncompleteMessage {
        expected: PREFIX_LEN,
        received: data.len(),
    })?;

    let end = PREFIX_LEN + len;
    if data.len() < end {
        return Err(ProtocolError::IncompleteMessage {
            expected: end,
            received: data.len(),
        });
    }

    Ok(&data[PREFIX_LEN..end])
}

fn declared_len(data: &[u8]) -> Option<usize> {
    let prefix: [u8; PREFIX_LEN] = data.get(..PREFIX_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Incremental frame decoder owning the carry-over buffer of one stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Creates a decoder with the default frame size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Creates a decoder that rejects frames larger than `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Appends freshly read bytes and returns every payload completed by them.
    ///
    /// Fails with [`ProtocolError::MessageTooLarge`] as soon as a pending frame
    /// declares a length above the limit; the stream is unusable afterwards.
    pub fn push(&mut self, data: &[u8]) -> ProtocolResult<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(data);

        let (frames, consumed) = {
            let (frames, rest) = decode_stream(&self.buffer);
            let frames: Vec<Vec<u8>> = frames.into_iter().map(<[u8]>::to_vec).collect();
            (frames, self.buffer.len() - rest.len())
        };
        self.buffer.drain(..consumed);

        if let Some(len) = declared_len(&self.buffer)
            && len > self.max_frame_size as usize
        {
            return Err(ProtocolError::MessageTooLarge {
                size: u32::try_from(len).unwrap_or(u32::MAX),
                max: self.max_frame_size,
            });
        }

        Ok(frames)
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
