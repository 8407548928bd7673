use crate::{
    allocator::MAX_ALLOC_SIZE,
    command::Command,
    error::{Result, SmuxError},
};

/// `stream_id: u32 | type: u8 | length: u32`, little-endian.
pub const HEADER_SIZE: usize = 9;

/// Largest payload a single frame may carry, bounded by the allocator's top
/// size class.
pub const MAX_PAYLOAD_SIZE: usize = MAX_ALLOC_SIZE;

/// One unit on the wire.
///
/// `data` is normally a buffer from the session's [`Allocator`], handed back
/// to it once the frame has been encoded or its payload consumed.
///
/// [`Allocator`]: crate::allocator::Allocator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: Command,
    pub stream_id: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(cmd: Command, stream_id: u32, data: Vec<u8>) -> Self {
        Self {
            cmd,
            stream_id,
            data,
        }
    }

    pub fn new_open(stream_id: u32) -> Self {
        Self::new(Command::Open, stream_id, Vec::new())
    }

    pub fn new_data(stream_id: u32, data: Vec<u8>) -> Self {
        Self::new(Command::Data, stream_id, data)
    }

    pub fn new_close(stream_id: u32) -> Self {
        Self::new(Command::Close, stream_id, Vec::new())
    }

    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    /// Checks the ID, the payload bound and that control frames are empty.
    pub fn validate(&self) -> Result<()> {
        if self.stream_id == 0 {
            return Err(SmuxError::InvalidStreamId(self.stream_id));
        }

        if self.data.len() > MAX_PAYLOAD_SIZE {
            return Err(SmuxError::FrameTooLarge {
                size: self.data.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if self.cmd.is_control() && !self.data.is_empty() {
            return Err(SmuxError::ProtocolViolation(
                "Control frames cannot carry data".to_string(),
            ));
        }

        Ok(())
    }
}
