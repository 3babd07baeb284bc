//! The framing seam between messages and sockets.
//!
//! The core never fixes a wire protocol's field layout; it only requires a
//! [`WireFormat`] that can turn a [`Message`] into bytes and a byte stream
//! into [`Frame`]s. [`LengthPrefixed`] is the default implementation used by
//! tests and demo wiring; real protocols supply their own.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::FrameError;
use crate::message::{Message, MessageId};

/// One complete inbound frame: the protocol verb plus its payload bytes.
#[derive(Debug)]
pub struct Frame {
    /// Message id carried by the frame.
    pub id: MessageId,
    /// Payload bytes, split out of the read buffer.
    pub payload: BytesMut,
}

/// Encodes and decodes the framing of a concrete wire protocol.
///
/// `decode` follows the incremental decoder convention: it consumes a
/// complete frame from the front of `src` when one is buffered, returns
/// `Ok(None)` when more bytes are needed, and errors only on malformed
/// input. Framing correctness is this trait's responsibility; the socket is
/// assumed reliable at the byte level.
pub trait WireFormat: Send + Sync {
    /// Append the full wire encoding of `message` to `dst`.
    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<(), FrameError>;

    /// Consume one complete frame from the front of `src`, if buffered.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError>;
}

/// Default framing: `u32` payload length, `u16` message id, payload bytes,
/// all big-endian.
#[derive(Debug, Clone)]
pub struct LengthPrefixed {
    max_frame_len: usize,
}

/// Length + id prefix in front of every payload.
const HEADER_LEN: usize = 6;

impl LengthPrefixed {
    /// Framing with a custom maximum payload length.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for LengthPrefixed {
    /// 1 MiB maximum payload.
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl WireFormat for LengthPrefixed {
    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = message.body_len();
        if len > self.max_frame_len {
            return Err(FrameError::Oversize {
                len,
                max: self.max_frame_len,
            });
        }
        dst.reserve(HEADER_LEN + len);
        dst.put_u32(len as u32);
        dst.put_u16(message.id().0);
        dst.extend_from_slice(message.body());
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = (&src[0..4]).get_u32() as usize;
        if len > self.max_frame_len {
            return Err(FrameError::Oversize {
                len,
                max: self.max_frame_len,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let id = MessageId(src.get_u16());
        let payload = src.split_to(len);
        Ok(Some(Frame { id, payload }))
    }
}
