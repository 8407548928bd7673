use crate::{
    allocator::{Allocator, default_allocator},
    error::{Result, SmuxError},
    frame::MAX_PAYLOAD_SIZE,
};
use std::sync::Arc;

/// First stream ID handed out by a client-role session.
pub const DEFAULT_CLIENT_STREAM_ID_BASE: u32 = 1;

/// First stream ID handed out by a server-role session. Everything below it
/// belongs to the client.
pub const DEFAULT_SERVER_STREAM_ID_BASE: u32 = 0x8000_0000;

/// Configuration for a smux session.
///
/// # Examples
///
/// ```rust
/// use smux_lite::{Config, ConfigBuilder};
///
/// let config = Config::default();
/// assert_eq!(config.max_frame_size, 32 * 1024);
///
/// let config = ConfigBuilder::new()
///     .max_frame_size(64 * 1024)
///     .accept_backlog(64)
///     .build()
///     .expect("Valid configuration");
/// assert_eq!(config.accept_backlog, 64);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest DATA payload this side emits. Writes are split to fit.
    pub max_frame_size: usize,
    /// Outbound frames queued for the writer task before writers wait.
    pub max_send_queue: usize,
    /// Peer-opened streams queued before the demultiplexer waits for
    /// `accept_stream`.
    pub accept_backlog: usize,
    /// First ID a client-role session opens.
    pub client_stream_id_base: u32,
    /// First ID a server-role session opens and the end of the client range.
    pub server_stream_id_base: u32,
    /// Pool for frame payload buffers.
    pub allocator: Arc<dyn Allocator>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 32 * 1024, // 32KB
            max_send_queue: 512,
            accept_backlog: 16,
            client_stream_id_base: DEFAULT_CLIENT_STREAM_ID_BASE,
            server_stream_id_base: DEFAULT_SERVER_STREAM_ID_BASE,
            allocator: default_allocator(),
        }
    }
}

impl Config {
    /// Rejects zero-sized limits, frames over 64 KiB and overlapping ID
    /// ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(SmuxError::Config("Max frame size cannot be 0".to_string()));
        }

        if self.max_frame_size > MAX_PAYLOAD_SIZE {
            return Err(SmuxError::Config(format!(
                "Max frame size cannot exceed {MAX_PAYLOAD_SIZE} bytes"
            )));
        }

        if self.max_send_queue == 0 {
            return Err(SmuxError::Config("Max send queue cannot be 0".to_string()));
        }

        if self.accept_backlog == 0 {
            return Err(SmuxError::Config("Accept backlog cannot be 0".to_string()));
        }

        if self.client_stream_id_base == 0 {
            return Err(SmuxError::Config(
                "Stream ID 0 is reserved".to_string(),
            ));
        }

        if self.client_stream_id_base >= self.server_stream_id_base {
            return Err(SmuxError::Config(
                "Client stream IDs must start below server stream IDs".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for creating custom `Config` instances.
///
/// Starts from `Config::default()` and validates on `build()`.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn max_send_queue(mut self, frames: usize) -> Self {
        self.config.max_send_queue = frames;
        self
    }

    pub fn accept_backlog(mut self, streams: usize) -> Self {
        self.config.accept_backlog = streams;
        self
    }

    pub fn client_stream_id_base(mut self, base: u32) -> Self {
        self.config.client_stream_id_base = base;
        self
    }

    pub fn server_stream_id_base(mut self, base: u32) -> Self {
        self.config.server_stream_id_base = base;
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.config.allocator = allocator;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
