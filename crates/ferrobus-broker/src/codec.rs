//! The development wire format: length-prefixed JSON frames.
//!
//! The broker core treats the D-Bus binary codec and its SASL exchange as
//! an external collaborator; this codec is the in-tree stand-in that makes
//! the daemon and its socket tests runnable end to end. Authentication
//! rests on socket credentials (`SO_PEERCRED`), which the listener reads
//! before the first frame.
//!
//! A frame is a little-endian `u32` payload length followed by a JSON
//! [`Message`].

use ferrobus_message::Message;
use thiserror::Error;

/// Frames above this size indicate a corrupt or hostile stream.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Codec failures; all of them poison the stream.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the limit")]
    Oversized(usize),
    #[error("frame payload is not a valid message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Incremental frame decoder and encoder.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: Vec<u8>,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes one message into a wire frame.
    pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
        let payload = serde_json::to_vec(message)?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(CodecError::Oversized(payload.len()));
        }
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Feeds raw bytes read off the socket.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<Message>, CodecError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(self.buffer[..4].try_into().expect("four bytes")) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(CodecError::Oversized(len));
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        let message = serde_json::from_slice(&self.buffer[4..4 + len])?;
        self.buffer.drain(..4 + len);
        Ok(Some(message))
    }

    /// Bytes buffered but not yet decodable.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}
