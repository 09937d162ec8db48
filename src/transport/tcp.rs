//! TCP listener implementation

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{Address, Conn, Metadata, Result};
use crate::error::Error;

use super::{Listener, ListenerOptions};

const LISTEN_BACKLOG: i32 = 1024;

/// Socket-level options requested by a listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketOptions {
    /// Multipath TCP
    pub mptcp: bool,
    /// `IP_TRANSPARENT`, for tproxy redirect listeners
    pub transparent: bool,
}

/// Factory for listening TCP sockets.
///
/// Listeners never create sockets directly so that the requested
/// [`SocketOptions`] can be observed and replaced.
pub trait ListenConfig: Send + Sync {
    fn listen_tcp(&self, addr: SocketAddr, opts: &SocketOptions) -> Result<tokio::net::TcpListener>;
}

/// Creates real OS sockets through socket2.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemListenConfig;

impl ListenConfig for SystemListenConfig {
    fn listen_tcp(&self, addr: SocketAddr, opts: &SocketOptions) -> Result<tokio::net::TcpListener> {
        let domain = Domain::for_address(addr);
        let socket = match Socket::new(domain, Type::STREAM, Some(stream_protocol(opts.mptcp))) {
            Ok(s) => s,
            // Kernel without MPTCP: fall back to plain TCP
            Err(e) if opts.mptcp => {
                warn!("mptcp unavailable ({}), using tcp", e);
                Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?
            }
            Err(e) => return Err(e.into()),
        };

        socket.set_reuse_address(true)?;
        if opts.transparent {
            set_transparent(&socket)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let std_listener: std::net::TcpListener = socket.into();
        Ok(tokio::net::TcpListener::from_std(std_listener)?)
    }
}

#[cfg(target_os = "linux")]
fn stream_protocol(mptcp: bool) -> Protocol {
    if mptcp {
        Protocol::MPTCP
    } else {
        Protocol::TCP
    }
}

#[cfg(not(target_os = "linux"))]
fn stream_protocol(_mptcp: bool) -> Protocol {
    Protocol::TCP
}

#[cfg(target_os = "linux")]
fn set_transparent(socket: &Socket) -> Result<()> {
    socket.set_ip_transparent(true)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_transparent(_socket: &Socket) -> Result<()> {
    Err(Error::Unsupported("tproxy requires linux".into()))
}

/// Resolve a listen address string to a bindable socket address.
pub(crate) fn bind_addr(addr: &str) -> Result<SocketAddr> {
    Address::parse(addr)?
        .as_socket()
        .ok_or_else(|| Error::Config(format!("Cannot bind to domain address {}", addr)))
}

/// Raw TCP listener without any decoration.
pub struct TcpBaseListener {
    listener: Mutex<Option<Arc<tokio::net::TcpListener>>>,
    local: SocketAddr,
    closed: CancellationToken,
    /// `Some(tproxy)` when the original destination should be recovered
    redirect: Option<bool>,
}

impl TcpBaseListener {
    pub fn bind(lc: &dyn ListenConfig, addr: SocketAddr, opts: &SocketOptions) -> Result<Self> {
        let listener = lc.listen_tcp(addr, opts)?;
        let local = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            local,
            closed: CancellationToken::new(),
            redirect: None,
        })
    }

    /// Builder: attach the pre-redirect destination to every connection
    pub fn with_original_dst(mut self, tproxy: bool) -> Self {
        self.redirect = Some(tproxy);
        self
    }
}

#[async_trait]
impl Listener for TcpBaseListener {
    async fn accept(&self) -> Result<Conn> {
        let listener = self.listener.lock().clone().ok_or(Error::Closed)?;

        let (stream, peer) = tokio::select! {
            _ = self.closed.cancelled() => return Err(Error::Closed),
            r = listener.accept() => r?,
        };
        drop(listener);

        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay on {}: {}", peer, e);
        }
        let local = stream.local_addr().unwrap_or(self.local);

        let dst = self
            .redirect
            .and_then(|tproxy| super::redirect::original_dst(&stream, tproxy));

        let mut conn = Conn::new(Box::new(stream), Address::Socket(peer), Address::Socket(local));
        if let Some(dst) = dst {
            conn = conn.with_original_dst(Address::Socket(dst));
        }
        Ok(conn)
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(self.local))
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        // Dropping the last Arc closes the socket
        self.listener.lock().take();
        Ok(())
    }
}

/// The `tcp` listener: a TCP socket behind the full decorator pipeline.
pub struct TcpListener;

impl TcpListener {
    pub async fn listen(opts: ListenerOptions, md: Metadata) -> Result<Box<dyn Listener>> {
        let addr = bind_addr(&opts.addr)?;
        let sock_opts = SocketOptions {
            mptcp: md.get_bool("mptcp"),
            transparent: false,
        };

        let base = TcpBaseListener::bind(opts.listen_config.as_ref(), addr, &sock_opts)?;
        if sock_opts.mptcp {
            debug!(service = %opts.service, "mptcp enabled");
        }

        Ok(opts.pipeline.wrap_listener(Box::new(base)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Records every socket request, then binds a plain loopback socket.
    #[derive(Default)]
    pub(crate) struct CapturingListenConfig {
        pub seen: Mutex<Vec<SocketOptions>>,
    }

    impl ListenConfig for CapturingListenConfig {
        fn listen_tcp(
            &self,
            addr: SocketAddr,
            opts: &SocketOptions,
        ) -> Result<tokio::net::TcpListener> {
            self.seen.lock().push(*opts);
            let std_listener = std::net::TcpListener::bind(addr)?;
            std_listener.set_nonblocking(true)?;
            Ok(tokio::net::TcpListener::from_std(std_listener)?)
        }
    }

    #[tokio::test]
    async fn test_tcp_listener_accepts() {
        let ln = TcpListener::listen(ListenerOptions::new("test", "127.0.0.1:0"), Metadata::new())
            .await
            .unwrap();
        let addr = ln.local_addr().unwrap().as_socket().unwrap();

        let client = tokio::spawn(async move {
            let mut s = tokio::net::TcpStream::connect(addr).await.unwrap();
            s.write_all(b"ping").await.unwrap();
        });

        let mut conn = ln.accept().await.unwrap();
        let mut buf = [0u8; 4];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(conn.local, Address::Socket(addr));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_mptcp_flag_requested() {
        let lc = Arc::new(CapturingListenConfig::default());
        let opts = ListenerOptions::new("test", "127.0.0.1:0").with_listen_config(lc.clone());
        TcpListener::listen(opts, Metadata::new().with("mptcp", true))
            .await
            .unwrap();

        assert_eq!(
            lc.seen.lock().as_slice(),
            &[SocketOptions { mptcp: true, transparent: false }]
        );
    }

    #[tokio::test]
    async fn test_mptcp_flag_not_requested_by_default() {
        let lc = Arc::new(CapturingListenConfig::default());
        let opts = ListenerOptions::new("test", "127.0.0.1:0").with_listen_config(lc.clone());
        TcpListener::listen(opts, Metadata::new()).await.unwrap();

        assert!(!lc.seen.lock()[0].mptcp);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_future_accepts() {
        let ln = Arc::new(
            TcpBaseListener::bind(
                &SystemListenConfig,
                "127.0.0.1:0".parse().unwrap(),
                &SocketOptions::default(),
            )
            .unwrap(),
        );

        let pending = {
            let ln = ln.clone();
            tokio::spawn(async move { ln.accept().await })
        };
        tokio::task::yield_now().await;
        ln.close().await.unwrap();

        let r = tokio::time::timeout(std::time::Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(r, Err(Error::Closed)));
        assert!(matches!(ln.accept().await, Err(Error::Closed)));
    }
}
