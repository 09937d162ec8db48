//! Stream multiplexing
//!
//! Carries many logical byte streams over one physical connection.
//! The framing is compatible with smux (versions 1 and 2):
//!
//! ```text
//! physical conn ──► recv loop ──► per-stream buffers ──► MuxStream::poll_read
//!                                └► accept queue ──────► Session::accept_stream
//! MuxStream::poll_write ──► data queue ──► send loop ──► physical conn
//! ```
//!
//! Version 2 adds per-stream flow control through UPD frames. Both versions
//! share a session-wide receive buffer: when readers fall behind the recv
//! loop stops reading from the physical connection.

mod frame;
mod session;
mod stream;

pub use frame::{Cmd, Frame, StreamId, HEADER_SIZE};
pub use session::Session;
pub use stream::MuxStream;

use std::time::Duration;

use crate::common::Metadata;
use crate::error::{Error, Result};

const DEFAULT_VERSION: u8 = 2;
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_FRAME_SIZE: usize = 32768;
const DEFAULT_MAX_RECEIVE_BUFFER: usize = 4 * 1024 * 1024;
const DEFAULT_MAX_STREAM_BUFFER: usize = 65536;

/// Session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Protocol version, 1 or 2
    pub version: u8,
    pub keepalive_disabled: bool,
    /// How often NOP frames are sent
    pub keepalive_interval: Duration,
    /// The session dies when nothing arrives for this long
    pub keepalive_timeout: Duration,
    /// Largest PSH payload this side sends
    pub max_frame_size: usize,
    /// Session-wide bound on buffered, unread bytes
    pub max_receive_buffer: usize,
    /// Per-stream window (version 2)
    pub max_stream_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION,
            keepalive_disabled: false,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_receive_buffer: DEFAULT_MAX_RECEIVE_BUFFER,
            max_stream_buffer: DEFAULT_MAX_STREAM_BUFFER,
        }
    }
}

impl Config {
    /// Read the `mux.*` metadata keys; absent or zero values keep the defaults.
    pub fn from_metadata(md: &Metadata) -> Self {
        let defaults = Self::default();
        let size = |key: &str, default: usize| match md.get_int(key) {
            n if n > 0 => n as usize,
            _ => default,
        };
        let duration = |key: &str, default: Duration| match md.get_duration(key) {
            d if d.is_zero() => default,
            d => d,
        };

        Self {
            version: match md.get_int("mux.version") {
                0 => defaults.version,
                v => v.clamp(0, i64::from(u8::MAX)) as u8,
            },
            keepalive_disabled: md.get_bool("mux.keepaliveDisabled"),
            keepalive_interval: duration("mux.keepaliveInterval", defaults.keepalive_interval),
            keepalive_timeout: duration("mux.keepaliveTimeout", defaults.keepalive_timeout),
            max_frame_size: size("mux.maxFrameSize", defaults.max_frame_size),
            max_receive_buffer: size("mux.maxReceiveBuffer", defaults.max_receive_buffer),
            max_stream_buffer: size("mux.maxStreamBuffer", defaults.max_stream_buffer),
        }
    }

    /// Reject parameter combinations a session cannot run with.
    pub fn verify(&self) -> Result<()> {
        if !(1..=2).contains(&self.version) {
            return Err(Error::Mux(format!("unsupported protocol version {}", self.version)));
        }
        if !self.keepalive_disabled {
            if self.keepalive_interval.is_zero() {
                return Err(Error::Mux("keep-alive interval must be positive".into()));
            }
            if self.keepalive_timeout < self.keepalive_interval {
                return Err(Error::Mux(
                    "keep-alive timeout must be larger than keep-alive interval".into(),
                ));
            }
        }
        if self.max_frame_size == 0 {
            return Err(Error::Mux("max frame size must be positive".into()));
        }
        if self.max_frame_size > frame::MAX_PAYLOAD {
            return Err(Error::Mux("max frame size must not be larger than 65535".into()));
        }
        if self.max_receive_buffer == 0 {
            return Err(Error::Mux("max receive buffer must be positive".into()));
        }
        if self.max_stream_buffer == 0 {
            return Err(Error::Mux("max stream buffer must be positive".into()));
        }
        if self.max_stream_buffer > self.max_receive_buffer {
            return Err(Error::Mux(
                "max stream buffer must not be larger than max receive buffer".into(),
            ));
        }
        if self.max_receive_buffer > u32::MAX as usize {
            return Err(Error::Mux("max receive buffer must fit in 32 bits".into()));
        }
        Ok(())
    }
}
