//! Transport Layer
//!
//! Responsibilities:
//! - Own the OS listening resources (TCP, Unix, UDP)
//! - Produce accepted connections as [`Conn`]
//! - Provide datagram sockets through [`PacketConn`]
//!
//! Cross-cutting controls (metrics, limits, admission) are NOT done here,
//! they are layered on top by [`crate::layer`].

mod mtcp;
mod redirect;
mod tcp;
mod tls;
mod udp;
mod unix;

pub use mtcp::{MtcpDialer, MtcpListener};
pub use redirect::RedirectTcpListener;
pub use tcp::{
    ListenConfig, SocketOptions, SystemListenConfig, TcpBaseListener, TcpListener,
};
pub use tls::{load_server_config, TlsListener};
pub use udp::{PacketConn, UdpConnListener, UdpPeerConn};
pub use unix::UnixListener;

use std::sync::Arc;

use async_trait::async_trait;

use crate::common::{Address, Conn, Result};
use crate::layer::Pipeline;

/// Listener trait for accepting incoming connections
///
/// Once `accept` has returned [`crate::Error::Closed`] it keeps doing so.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept a new connection
    async fn accept(&self) -> Result<Conn>;

    /// Get the local bound address
    fn local_addr(&self) -> Result<Address>;

    /// Close the listener, releasing the OS resource
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<L: Listener + ?Sized> Listener for Arc<L> {
    async fn accept(&self) -> Result<Conn> {
        (**self).accept().await
    }

    fn local_addr(&self) -> Result<Address> {
        (**self).local_addr()
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

/// Everything a listener factory needs besides its metadata.
#[derive(Clone)]
pub struct ListenerOptions {
    /// Address to bind (`host:port`, `:port`, or a socket path)
    pub addr: String,
    /// Service name used as metrics label and log field
    pub service: String,
    /// Decorators applied to the raw listener or to each connection
    pub pipeline: Pipeline,
    /// How TCP sockets are created
    pub listen_config: Arc<dyn ListenConfig>,
    /// Server-side TLS settings, required by the `tls` listener
    pub tls: Option<Arc<tokio_rustls::rustls::ServerConfig>>,
}

impl ListenerOptions {
    pub fn new(service: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            service: service.into(),
            pipeline: Pipeline::default(),
            listen_config: Arc::new(SystemListenConfig),
            tls: None,
        }
    }

    /// Builder: set the decorator pipeline
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Builder: replace the socket factory
    pub fn with_listen_config(mut self, lc: Arc<dyn ListenConfig>) -> Self {
        self.listen_config = lc;
        self
    }

    /// Builder: set the TLS server config
    pub fn with_tls(mut self, tls: Arc<tokio_rustls::rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}
