//! Accepted connections and client identity

use super::{Address, Stream};

/// Identity of an authenticated client.
///
/// Handlers pass it explicitly down to whatever needs per-client
/// bookkeeping. An absent identity maps to the anonymous bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A connection produced by a listener.
///
/// The stream may be a raw socket or a logical stream riding on a shared
/// physical connection; decorators replace `stream` and may rewrite `peer`.
pub struct Conn {
    pub stream: Stream,
    /// Perceived remote address
    pub peer: Address,
    /// Local address the connection arrived on
    pub local: Address,
    /// Destination before a redirect, when the listener can recover it
    pub original_dst: Option<Address>,
}

impl Conn {
    pub fn new(stream: Stream, peer: Address, local: Address) -> Self {
        Self {
            stream,
            peer,
            local,
            original_dst: None,
        }
    }

    /// Builder: set the pre-redirect destination
    pub fn with_original_dst(mut self, dst: Address) -> Self {
        self.original_dst = Some(dst);
        self
    }

    /// Replace the stream, keeping the addresses.
    pub fn map_stream(self, f: impl FnOnce(Stream) -> Stream) -> Self {
        Self {
            stream: f(self.stream),
            ..self
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("peer", &self.peer)
            .field("local", &self.local)
            .field("original_dst", &self.original_dst)
            .finish()
    }
}
