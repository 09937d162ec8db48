//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Stream: unified async I/O abstraction
//! - Conn: an accepted connection with its addresses
//! - Metadata: typed access to listener/handler settings
//! - Address: network address representation

mod address;
mod conn;
mod metadata;
mod stream;

pub use address::Address;
pub use conn::{ClientId, Conn};
pub use metadata::{parse_duration, Metadata, Network};
pub use stream::{AsyncReadWrite, IntoStream, Rewind, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
