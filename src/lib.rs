//! Lightweight stream multiplexing over a single byte-stream transport.
//!
//! A [`Session`] interleaves many [`Stream`]s over one connection. Streams
//! follow a request/response pattern: the client writes its request with
//! [`Stream::write_once`], the server reads to end-of-stream, and answers with
//! its own `write_once`. [`Server`] and [`Client`] package that pattern over
//! TCP.

pub mod allocator;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod net;
pub mod server;
pub mod session;
pub mod stream;
pub mod stream_id;

pub use allocator::{Allocator, DefaultAllocator, default_allocator};
pub use client::Client;
pub use codec::Codec;
pub use command::Command;
pub use config::{Config, ConfigBuilder};
pub use error::{Result, SmuxError};
pub use frame::{Frame, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use net::{Listener, dial};
pub use server::{Handler, Server};
pub use session::Session;
pub use stream::{Stream, StreamState};
pub use stream_id::{Role, StreamIdGenerator};
