//! RelayKit - building blocks for a SOCKS5 / redirect proxy
//!
//! # Architecture (Decorated Listeners)
//!
//! ```text
//! Listener (tcp / tls / unix / red / redu / mtcp)
//! → Layer pipeline (proxy protocol, metrics, stats, admission, limits)
//! → Handler (socks5 / redirect)
//! → Dialer (direct, optionally asking a router plugin)
//! ```
//!
//! ## Core Principles
//!
//! - Listeners only produce connections, policy is layered on top
//! - All seams abstracted via traits
//! - Data flows as Stream + addresses
//! - Every component is built from an explicit [`app::Registry`]
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Conn, Metadata, Address
//! ├── transport/       # Listeners and datagram sockets
//! ├── layer/           # Listener decorators
//! ├── mux/             # Stream multiplexing for mtcp
//! ├── limiter/         # Traffic and connection limits
//! ├── handler/         # SOCKS5 and redirect handlers, UDP relay
//! ├── router/          # Outbound dialing and route plugins
//! └── app/             # Registry, Runtime, metrics endpoint
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod transport;
pub mod layer;
pub mod mux;
pub mod handler;
pub mod router;
pub mod app;

// Supporting modules
pub mod bypass;
pub mod config;
pub mod limiter;
pub mod matcher;
pub mod stats;

// Re-exports for convenience
pub use common::{Address, ClientId, Conn, Metadata, Network, Stream};
pub use error::{Error, Result};
pub use config::Config;

// Architecture re-exports
pub use app::{Registry, Runtime};
pub use handler::Handler;
pub use router::Dialer;
pub use transport::{Listener, PacketConn};
