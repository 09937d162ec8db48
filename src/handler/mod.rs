//! Handler Layer
//!
//! A handler owns one accepted connection for its whole life: it runs the
//! protocol handshake (if any), dials the outbound side through the
//! [`Dialer`] and relays.
//!
//! ```text
//! Listener.accept() → Conn → Handler.handle()
//!                               ├─ socks5: CONNECT / UDP ASSOCIATE
//!                               └─ redirect: original destination
//! ```

mod redirect;
mod socks5;
mod socks_udp;
mod udp_relay;

pub use redirect::RedirectHandler;
pub use socks5::Socks5Handler;
pub use socks_udp::{SocksUdpConn, UdpHeader};
pub use udp_relay::UdpRelay;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::bypass::Bypass;
use crate::common::{Conn, Result, Stream};
use crate::router::{Dialer, DirectDialer};
use crate::stats::StatsSet;

/// Relay buffer size (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Connection handler
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serve `conn` until either side is done.
    async fn handle(&self, conn: Conn) -> Result<()>;
}

/// Username/password pairs accepted by a handler.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    users: HashMap<String, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: accept `user` with `password`
    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(user.into(), password.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        self.users.get(user).is_some_and(|p| p == password)
    }
}

/// Collaborators shared by every connection of a service.
#[derive(Clone)]
pub struct HandlerOptions {
    pub service: String,
    pub dialer: Arc<dyn Dialer>,
    pub bypass: Option<Arc<Bypass>>,
    pub credentials: Option<Credentials>,
    /// Per-client counters; `None` turns client stats off
    pub stats: Option<Arc<StatsSet>>,
}

impl HandlerOptions {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            dialer: Arc::new(DirectDialer::new()),
            bypass: None,
            credentials: None,
            stats: None,
        }
    }

    /// Builder: set the outbound dialer
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Builder: set the bypass list
    pub fn with_bypass(mut self, bypass: Arc<Bypass>) -> Self {
        self.bypass = Some(bypass);
        self
    }

    /// Builder: require authentication
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials).filter(|c| !c.is_empty());
        self
    }

    /// Builder: keep per-client counters in `stats`
    pub fn with_stats(mut self, stats: Arc<StatsSet>) -> Self {
        self.stats = Some(stats);
        self
    }
}

/// Copy both directions until each side has finished.
///
/// Returns the bytes moved `(a → b, b → a)`. When one direction ends, the
/// write half it fed is shut down so the peer sees EOF.
pub(crate) async fn relay(a: Stream, b: Stream) -> (u64, u64) {
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let upload = async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = match a_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if b_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            total += n as u64;
        }
        let _ = b_write.shutdown().await;
        total
    };

    let download = async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = match b_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if a_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            total += n as u64;
        }
        let _ = a_write.shutdown().await;
        total
    };

    tokio::join!(upload, download)
}
