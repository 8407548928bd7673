use crate::{
    allocator::Allocator,
    command::Command,
    error::SmuxError,
    frame::{Frame, HEADER_SIZE, MAX_PAYLOAD_SIZE},
};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone)]
pub struct Codec {
    allocator: Arc<dyn Allocator>,
}

impl Codec {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self { allocator }
    }

    /// Reads `(stream_id, type byte, length)` without consuming `src`.
    fn peek_header(src: &[u8]) -> (u32, u8, usize) {
        let mut header = &src[..HEADER_SIZE];
        let stream_id = header.get_u32_le();
        let cmd = header.get_u8();
        let length = header.get_u32_le() as usize;
        (stream_id, cmd, length)
    }

    fn encode_header(dst: &mut BytesMut, stream_id: u32, cmd: Command, length: u32) {
        dst.put_u32_le(stream_id);
        dst.put_u8(cmd.to_byte());
        dst.put_u32_le(length);
    }
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = SmuxError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let (stream_id, cmd_byte, length) = Self::peek_header(src);
        let cmd = Command::from_byte(cmd_byte)?;

        if length > MAX_PAYLOAD_SIZE {
            return Err(SmuxError::FrameTooLarge {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total_frame_size = HEADER_SIZE + length;
        if src.len() < total_frame_size {
            src.reserve(total_frame_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let data = if length == 0 {
            Vec::new()
        } else {
            let mut buf = self.allocator.get(length)?;
            buf.copy_from_slice(&src[..length]);
            src.advance(length);
            buf
        };

        let frame = Frame::new(cmd, stream_id, data);
        frame.validate()?;

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for Codec {
    type Error = SmuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        frame.validate()?;

        dst.reserve(frame.total_size());
        Self::encode_header(dst, frame.stream_id, frame.cmd, frame.data.len() as u32);
        dst.put_slice(&frame.data);

        if frame.data.capacity() > 0 {
            if let Err(e) = self.allocator.put(frame.data) {
                tracing::trace!("payload buffer not returned to pool: {}", e);
            }
        }

        Ok(())
    }
}
