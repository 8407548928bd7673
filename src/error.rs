use std::io;
use thiserror::Error;

/// Convenient type alias for `Result<T, SmuxError>`.
pub type Result<T> = std::result::Result<T, SmuxError>;

/// Error types for the smux library.
///
/// `SmuxError` covers transport failures, protocol violations, allocator
/// misuse and stream-state errors. Errors that cross an `AsyncRead` or
/// `AsyncWrite` boundary are carried inside an [`io::Error`] and unwrapped
/// again by `From<io::Error>`.
#[derive(Debug, Error)]
pub enum SmuxError {
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid frame type: {0}")]
    InvalidFrame(u8),

    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(u32),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Stream {0} is closed for writing")]
    StreamClosed(u32),

    #[error("Stream ID space exhausted")]
    StreamIdExhausted,

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Allocation size out of range: {0}")]
    InvalidAllocSize(usize),

    #[error("Allocator put() incorrect buffer size: {0}")]
    IncorrectBufferSize(usize),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SmuxError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            SmuxError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            SmuxError::StreamClosed(_)
            | SmuxError::InvalidAllocSize(_)
            | SmuxError::IncorrectBufferSize(_) => true,
            SmuxError::SessionClosed
            | SmuxError::ListenerClosed
            | SmuxError::StreamIdExhausted
            | SmuxError::Config(_) => false,
            SmuxError::FrameTooLarge { .. }
            | SmuxError::InvalidFrame(_)
            | SmuxError::InvalidStreamId(_)
            | SmuxError::ProtocolViolation(_) => false,
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            SmuxError::Io(e) => e.kind(),
            SmuxError::SessionClosed => io::ErrorKind::ConnectionAborted,
            SmuxError::StreamClosed(_) => io::ErrorKind::BrokenPipe,
            SmuxError::FrameTooLarge { .. }
            | SmuxError::InvalidFrame(_)
            | SmuxError::InvalidStreamId(_)
            | SmuxError::ProtocolViolation(_) => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<io::Error> for SmuxError {
    fn from(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<SmuxError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(smux) = inner.downcast::<SmuxError>() {
                    return *smux;
                }
            }
            return SmuxError::SessionClosed;
        }
        SmuxError::Io(err)
    }
}

impl From<SmuxError> for io::Error {
    fn from(err: SmuxError) -> Self {
        match err {
            SmuxError::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_error_display() {
        let err = SmuxError::InvalidFrame(7);
        assert_eq!(err.to_string(), "Invalid frame type: 7");

        let err = SmuxError::FrameTooLarge {
            size: 70000,
            max: 65536,
        };
        assert_eq!(err.to_string(), "Frame too large: 70000 bytes (max: 65536)");

        let err = SmuxError::IncorrectBufferSize(3);
        assert_eq!(
            err.to_string(),
            "Allocator put() incorrect buffer size: 3"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::UnexpectedEof, "Connection lost");
        let smux_err: SmuxError = io_err.into();

        match smux_err {
            SmuxError::Io(e) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            _ => panic!("Expected SmuxError::Io"),
        }
    }

    #[test]
    fn test_smux_error_survives_io_round_trip() {
        let io_err: IoError = SmuxError::StreamClosed(9).into();
        assert_eq!(io_err.kind(), ErrorKind::BrokenPipe);

        let back: SmuxError = io_err.into();
        assert!(matches!(back, SmuxError::StreamClosed(9)));

        let io_err: IoError = SmuxError::SessionClosed.into();
        assert_eq!(io_err.kind(), ErrorKind::ConnectionAborted);
    }

    #[test]
    fn test_is_recoverable() {
        let would_block = SmuxError::Io(IoError::new(ErrorKind::WouldBlock, ""));
        assert!(would_block.is_recoverable());

        assert!(SmuxError::StreamClosed(1).is_recoverable());
        assert!(SmuxError::InvalidAllocSize(0).is_recoverable());
        assert!(SmuxError::IncorrectBufferSize(3).is_recoverable());

        assert!(!SmuxError::SessionClosed.is_recoverable());
        assert!(!SmuxError::InvalidFrame(9).is_recoverable());
        assert!(!SmuxError::Config("Invalid".to_string()).is_recoverable());
        assert!(
            !SmuxError::FrameTooLarge {
                size: 1024,
                max: 512,
            }
            .is_recoverable()
        );

        let other_io_err = SmuxError::Io(IoError::new(ErrorKind::UnexpectedEof, ""));
        assert!(!other_io_err.is_recoverable());
    }
}
