//! Multiplexed TCP listener and dialer
//!
//! Every physical TCP connection carries a mux session; every logical
//! stream of every session is delivered through one bounded accept queue.
//!
//! ```text
//! base listener ──► accept loop ──► session task (1 per physical conn)
//!                        │                 │ accept_stream
//!                        ▼                 ▼
//!                  err channel       accept queue (backlog, drop newest)
//!                        └───────┬─────────┘
//!                                ▼
//!                      MtcpListener::accept
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::metrics;
use crate::common::{Address, Conn, Metadata, Result};
use crate::error::Error;
use crate::mux::{self, Session};

use super::tcp::{bind_addr, SocketOptions, TcpBaseListener};
use super::{Listener, ListenerOptions};

const DEFAULT_BACKLOG: usize = 128;

/// The `mtcp` listener.
pub struct MtcpListener {
    base: Arc<dyn Listener>,
    local: Address,
    queue: tokio::sync::Mutex<mpsc::Receiver<Conn>>,
    errs: tokio::sync::Mutex<mpsc::Receiver<Error>>,
    closed: CancellationToken,
}

/// Settings shared by every session task of one listener.
#[derive(Clone)]
struct SessionSettings {
    service: String,
    config: mux::Config,
    handshake_timeout: Option<Duration>,
}

impl MtcpListener {
    pub async fn listen(opts: ListenerOptions, md: Metadata) -> Result<Box<dyn Listener>> {
        let config = mux::Config::from_metadata(&md);
        config.verify()?;

        let backlog = match md.get_int("backlog") {
            n if n > 0 => n as usize,
            _ => DEFAULT_BACKLOG,
        };
        let handshake_timeout = Some(md.get_duration("handshakeTimeout")).filter(|d| !d.is_zero());

        let addr = bind_addr(&opts.addr)?;
        let sock_opts = SocketOptions {
            mptcp: md.get_bool("mptcp"),
            transparent: false,
        };
        let raw = TcpBaseListener::bind(opts.listen_config.as_ref(), addr, &sock_opts)?;
        if sock_opts.mptcp {
            debug!(service = %opts.service, "mptcp enabled");
        }
        let base: Arc<dyn Listener> = Arc::from(opts.pipeline.wrap_listener(Box::new(raw)));

        let settings = SessionSettings {
            service: opts.service.clone(),
            config,
            handshake_timeout,
        };
        Ok(Box::new(Self::serve(base, backlog, settings)?))
    }

    fn serve(base: Arc<dyn Listener>, backlog: usize, settings: SessionSettings) -> Result<Self> {
        let local = base.local_addr()?;
        let (queue_tx, queue_rx) = mpsc::channel(backlog);
        let (err_tx, err_rx) = mpsc::channel(1);

        tokio::spawn(accept_loop(base.clone(), queue_tx, err_tx, settings));

        Ok(Self {
            base,
            local,
            queue: tokio::sync::Mutex::new(queue_rx),
            errs: tokio::sync::Mutex::new(err_rx),
            closed: CancellationToken::new(),
        })
    }
}

/// Pull physical connections until the base listener fails, then report
/// the failure once and drop the error channel.
async fn accept_loop(
    base: Arc<dyn Listener>,
    queue: mpsc::Sender<Conn>,
    err_tx: mpsc::Sender<Error>,
    settings: SessionSettings,
) {
    loop {
        match base.accept().await {
            Ok(conn) => {
                debug!(
                    service = %settings.service,
                    remote = %conn.peer,
                    state = "accepted",
                    "mux connection"
                );
                tokio::spawn(serve_session(conn, queue.clone(), settings.clone()));
            }
            Err(e) => {
                if !e.is_closed() {
                    error!(service = %settings.service, "accept: {}", e);
                }
                let _ = err_tx.send(e).await;
                return;
            }
        }
    }
}

async fn serve_session(conn: Conn, queue: mpsc::Sender<Conn>, settings: SessionSettings) {
    let peer = conn.peer.clone();
    let local = conn.local.clone();
    let service = settings.service.as_str();

    debug!(service, remote = %peer, state = "handshaking", "mux connection");
    let session = match Session::server(conn, &settings.config, settings.handshake_timeout) {
        Ok(s) => s,
        Err(e) => {
            error!(service, remote = %peer, "mux handshake: {}", e);
            return;
        }
    };
    debug!(service, remote = %peer, state = "active", "mux connection");

    loop {
        let stream = match session.accept_stream().await {
            Ok(s) => s,
            Err(e) => {
                debug!(service, remote = %peer, state = "closed", "mux connection: {}", e);
                return;
            }
        };

        let conn = Conn::new(Box::new(stream), peer.clone(), local.clone());
        match queue.try_send(conn) {
            Ok(()) => {}
            Err(TrySendError::Full(conn)) => {
                drop(conn);
                metrics::MUX_STREAMS_DROPPED.with_label_values(&[service]).inc();
                warn!(service, "connection queue is full, client {} discarded", peer);
            }
            // Listener gone: nobody will ever accept from this session
            Err(TrySendError::Closed(_)) => return,
        }
    }
}

#[async_trait]
impl Listener for MtcpListener {
    async fn accept(&self) -> Result<Conn> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        let mut queue = self.queue.lock().await;
        let mut errs = self.errs.lock().await;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Closed),
            Some(conn) = queue.recv() => Ok(conn),
            err = errs.recv() => Err(err.unwrap_or(Error::Closed)),
        }
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(self.local.clone())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        self.base.close().await
    }
}

/// Client side of the `mtcp` transport.
///
/// One physical connection is shared by every dial while its session lives;
/// a dead session is replaced on the next dial.
pub struct MtcpDialer {
    addr: String,
    config: mux::Config,
    session: tokio::sync::Mutex<Option<Arc<Session>>>,
}

impl MtcpDialer {
    pub fn new(addr: impl Into<String>, config: mux::Config) -> Result<Self> {
        config.verify()?;
        Ok(Self {
            addr: addr.into(),
            config,
            session: tokio::sync::Mutex::new(None),
        })
    }

    /// Open a new logical stream to the server.
    pub async fn dial(&self) -> Result<Conn> {
        let session = self.session().await?;
        let stream = session.open_stream().await?;
        Ok(Conn::new(
            Box::new(stream),
            session.peer_addr().clone(),
            session.local_addr().clone(),
        ))
    }

    async fn session(&self) -> Result<Arc<Session>> {
        let mut guard = self.session.lock().await;
        if let Some(s) = guard.as_ref().filter(|s| !s.is_closed()) {
            return Ok(s.clone());
        }

        let target = Address::parse(&self.addr)?.resolve().await?;
        let stream = tokio::net::TcpStream::connect(target).await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        info!(server = %target, "mux session established");

        let conn = Conn::new(Box::new(stream), Address::Socket(target), Address::Socket(local));
        let session = Arc::new(Session::client(conn, &self.config)?);
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Close the current session, if any.
    pub async fn close(&self) {
        if let Some(s) = self.session.lock().await.take() {
            s.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::tests::CapturingListenConfig;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn listen(md: Metadata) -> Box<dyn Listener> {
        MtcpListener::listen(ListenerOptions::new("mtcp-test", "127.0.0.1:0"), md)
            .await
            .unwrap()
    }

    fn addr_of(ln: &dyn Listener) -> String {
        ln.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_streams_roundtrip() {
        let ln = listen(Metadata::new()).await;
        let dialer = MtcpDialer::new(addr_of(ln.as_ref()), mux::Config::default()).unwrap();

        let mut c = dialer.dial().await.unwrap();
        c.stream.write_all(b"ping").await.unwrap();

        let mut s = tokio::time::timeout(Duration::from_secs(2), ln.accept())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 4];
        s.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        s.stream.write_all(b"pong").await.unwrap();
        c.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Second dial rides the same physical connection
        let c2 = dialer.dial().await.unwrap();
        assert_eq!(c2.local, c.local);
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let ln = listen(Metadata::new().with("backlog", 2)).await;
        let dialer = MtcpDialer::new(addr_of(ln.as_ref()), mux::Config::default()).unwrap();

        let mut clients = Vec::new();
        for _ in 0..5 {
            let mut c = dialer.dial().await.unwrap();
            c.stream.write_all(b"x").await.unwrap();
            clients.push(c);
        }
        // Let the session task offer every stream before draining
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut delivered = 0;
        while let Ok(Ok(_)) = tokio::time::timeout(Duration::from_millis(200), ln.accept()).await {
            delivered += 1;
        }
        assert_eq!(delivered, 2);

        // Dropped streams were FIN'd: their clients read EOF
        let mut eof = 0;
        for c in clients.iter_mut().skip(2) {
            let mut buf = [0u8; 1];
            if let Ok(Ok(0)) =
                tokio::time::timeout(Duration::from_secs(1), c.stream.read(&mut buf)).await
            {
                eof += 1;
            }
        }
        assert_eq!(eof, 3);
    }

    #[tokio::test]
    async fn test_bad_session_does_not_block_others() {
        let ln = listen(Metadata::new()).await;
        let addr = addr_of(ln.as_ref());

        // Session A speaks garbage
        let mut bad = tokio::net::TcpStream::connect(&addr).await.unwrap();
        bad.write_all(&[0xff; 32]).await.unwrap();

        // Session B is well-behaved
        let dialer = MtcpDialer::new(addr.clone(), mux::Config::default()).unwrap();
        let mut c = dialer.dial().await.unwrap();
        c.stream.write_all(b"ok").await.unwrap();

        let mut s = tokio::time::timeout(Duration::from_secs(2), ln.accept())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 2];
        s.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        // The garbage session was torn down
        let mut rest = Vec::new();
        let r = tokio::time::timeout(Duration::from_secs(2), bad.read_to_end(&mut rest)).await;
        assert!(r.is_ok());

        // New physical connections are still accepted
        let dialer2 = MtcpDialer::new(addr, mux::Config::default()).unwrap();
        let _c2 = dialer2.dial().await.unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(2), ln.accept())
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_handshake_timeout_closes_silent_connection() {
        let ln = listen(Metadata::new().with("handshakeTimeout", "100ms")).await;
        let mut silent = tokio::net::TcpStream::connect(addr_of(ln.as_ref()))
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), silent.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let ln: Arc<dyn Listener> = Arc::from(listen(Metadata::new()).await);

        let pending = {
            let ln = ln.clone();
            tokio::spawn(async move { ln.accept().await })
        };
        tokio::task::yield_now().await;
        ln.close().await.unwrap();

        let r = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(r, Err(Error::Closed)));
        assert!(matches!(ln.accept().await, Err(Error::Closed)));
        assert!(matches!(ln.accept().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_mptcp_flag_capture() {
        for enabled in [true, false] {
            let lc = Arc::new(CapturingListenConfig::default());
            let opts = ListenerOptions::new("mtcp-test", "127.0.0.1:0").with_listen_config(lc.clone());
            let ln = MtcpListener::listen(opts, Metadata::new().with("mptcp", enabled))
                .await
                .unwrap();
            assert_eq!(lc.seen.lock()[0].mptcp, enabled);
            ln.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_version_one_session() {
        let ln = listen(Metadata::new().with("mux.version", 1)).await;
        let mut raw = tokio::net::TcpStream::connect(addr_of(ln.as_ref()))
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        mux::Frame::new(1, mux::Cmd::Syn, 3).encode(&mut buf);
        mux::Frame::data(1, 3, bytes::Bytes::from_static(b"v1")).encode(&mut buf);
        raw.write_all(&buf).await.unwrap();

        let mut s = tokio::time::timeout(Duration::from_secs(2), ln.accept())
            .await
            .unwrap()
            .unwrap();
        let mut data = [0u8; 2];
        s.stream.read_exact(&mut data).await.unwrap();
        assert_eq!(&data, b"v1");
    }

    #[tokio::test]
    async fn test_invalid_mux_config_fails_listen() {
        let r = MtcpListener::listen(
            ListenerOptions::new("mtcp-test", "127.0.0.1:0"),
            Metadata::new().with("mux.maxFrameSize", 100_000),
        )
        .await;
        assert!(r.is_err());
    }
}
