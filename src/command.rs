use crate::error::{Result, SmuxError};

/// Frame type carried in the header's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Announces a new stream.
    Open,
    /// Carries stream payload.
    Data,
    /// The sender will write nothing more on this stream.
    Close,
}

impl Command {
    pub const OPEN: u8 = 0;
    pub const DATA: u8 = 1;
    pub const CLOSE: u8 = 2;

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            Self::OPEN => Ok(Command::Open),
            Self::DATA => Ok(Command::Data),
            Self::CLOSE => Ok(Command::Close),
            _ => Err(SmuxError::InvalidFrame(byte)),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Command::Open => Self::OPEN,
            Command::Data => Self::DATA,
            Command::Close => Self::CLOSE,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Command::Open | Command::Close)
    }
}
