//! Wire framing between clients and the daemon.
//!
//! A frame is the payload length as a big-endian `u32`, then that many bytes
//! of UTF-8 JSON holding one `{type, arguments}` envelope. Frames above
//! [`MAX_FRAME_LENGTH`] are refused in both directions.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::Message;

/// Largest accepted payload, 16 MB.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Turns a byte stream into [`Message`]s and back.
///
/// Stateless: an incomplete frame stays in the read buffer until the rest
/// has arrived.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Payload length announced by the header at the front of `src`.
fn announced_length(src: &[u8]) -> Option<usize> {
    let header: [u8; HEADER_LEN] = src.get(..HEADER_LEN)?.try_into().ok()?;
    usize::try_from(u32::from_be_bytes(header)).ok()
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        let Some(length) = announced_length(src) else {
            return Ok(None);
        };
        if length > MAX_FRAME_LENGTH {
            return Err(CodecError::FrameTooLarge(length));
        }

        let frame_length = HEADER_LEN + length;
        if src.len() < frame_length {
            src.reserve(frame_length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length);
        let text = std::str::from_utf8(&payload)?;
        Ok(Some(serde_json::from_str(text)?))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(&message)?;
        let length = u32::try_from(payload.len())
            .ok()
            .filter(|_| payload.len() <= MAX_FRAME_LENGTH)
            .ok_or(CodecError::FrameTooLarge(payload.len()))?;

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(length);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Errors raised while framing or parsing messages.
///
/// Any of them on an inbound stream is a protocol violation.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Connection I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Frame of {0} bytes exceeds {MAX_FRAME_LENGTH}")]
    FrameTooLarge(usize),
}
