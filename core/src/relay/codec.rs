// Stream framing for STUN over TCP
//
// Each frame is one STUN message; its length comes from the header. The
// decoder hands back the parsed message together with the raw bytes, which
// integrity verification needs.

use super::stun::{frame_len, StunError, StunMessage, HEADER_LEN};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct StunFrame {
    pub message: StunMessage,
    pub raw: Bytes,
}

#[derive(Debug, Clone)]
pub struct StunCodec {
    max_frame_len: usize,
}

impl StunCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.max(HEADER_LEN),
        }
    }
}

impl Default for StunCodec {
    fn default() -> Self {
        Self::new(u16::MAX as usize + HEADER_LEN)
    }
}

impl Decoder for StunCodec {
    type Item = StunFrame;
    type Error = StunError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(total) = frame_len(src)? else {
                return Ok(None);
            };
            if total > self.max_frame_len {
                return Err(StunError::TooLarge {
                    size: total,
                    max: self.max_frame_len,
                });
            }
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let raw = src.split_to(total).freeze();
            match StunMessage::decode(&raw) {
                Ok(message) => return Ok(Some(StunFrame { message, raw })),
                // Framing is intact, so a bad message can be skipped
                Err(e) => warn!("Dropping malformed STUN message: {}", e),
            }
        }
    }
}

impl Encoder<Bytes> for StunCodec {
    type Error = StunError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_len {
            return Err(StunError::TooLarge {
                size: item.len(),
                max: self.max_frame_len,
            });
        }
        dst.reserve(item.len());
        dst.extend_from_slice(item.chunk());
        Ok(())
    }
}
