use crate::{
    config::Config,
    error::{Result, SmuxError},
};
use std::sync::atomic::{AtomicU64, Ordering};

/// Which end of the connection a session represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    /// Half-open ID range `[start, end)` owned by this role.
    pub fn id_range(self, config: &Config) -> (u32, u64) {
        match self {
            Role::Client => (
                config.client_stream_id_base,
                config.server_stream_id_base as u64,
            ),
            Role::Server => (config.server_stream_id_base, u32::MAX as u64 + 1),
        }
    }
}

/// Hands out increasing stream IDs from one role's range.
///
/// The counter is 64 bits wide so exhausting the 32-bit range can never wrap
/// back to an ID already in use.
#[derive(Debug)]
pub struct StreamIdGenerator {
    next_id: AtomicU64,
    start: u32,
    end: u64,
}

impl StreamIdGenerator {
    pub fn new(start: u32, end: u64) -> Self {
        Self {
            next_id: AtomicU64::new(start as u64),
            start,
            end,
        }
    }

    pub fn for_role(role: Role, config: &Config) -> Self {
        let (start, end) = role.id_range(config);
        Self::new(start, end)
    }

    pub fn next(&self) -> Result<u32> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id >= self.end {
            return Err(SmuxError::StreamIdExhausted);
        }
        Ok(id as u32)
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        stream_id >= self.start && (stream_id as u64) < self.end
    }
}

/// Checks that a stream opened by the remote side lies in the remote
/// side's range.
pub fn validate_peer_stream_id(local: Role, config: &Config, stream_id: u32) -> Result<()> {
    let (start, end) = local.peer().id_range(config);
    if stream_id == 0 || stream_id < start || stream_id as u64 >= end {
        return Err(SmuxError::InvalidStreamId(stream_id));
    }
    Ok(())
}
