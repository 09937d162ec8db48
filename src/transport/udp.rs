//! UDP transport: datagram sockets and the per-client UDP listener
//!
//! UDP is connectionless, so the listener fakes connections: the first
//! datagram from a new client address creates a [`UdpPeerConn`] and every
//! following datagram from that address is delivered to it.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{Address, Conn, Metadata, Result};
use crate::error::Error;
use crate::layer::Pipeline;

use super::tcp::bind_addr;
use super::{Listener, ListenerOptions};

const DEFAULT_BACKLOG: usize = 128;
const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
const DEFAULT_READ_QUEUE_SIZE: usize = 128;
const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Datagram-oriented connection.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive one datagram, returning its length and the peer it came from
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)>;

    /// Send one datagram to `target`
    async fn send_to(&self, buf: &[u8], target: &Address) -> Result<usize>;

    fn local_addr(&self) -> Result<Address>;
}

#[async_trait]
impl PacketConn for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let (n, peer) = UdpSocket::recv_from(self, buf).await?;
        // Dual-stack sockets report IPv4 peers as ::ffff:a.b.c.d
        let peer = SocketAddr::new(peer.ip().to_canonical(), peer.port());
        Ok((n, Address::Socket(peer)))
    }

    async fn send_to(&self, buf: &[u8], target: &Address) -> Result<usize> {
        let target = match (target.resolve().await?, UdpSocket::local_addr(self)?) {
            (SocketAddr::V4(v4), SocketAddr::V6(_)) => {
                SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
            }
            (target, _) => target,
        };
        Ok(UdpSocket::send_to(self, buf, target).await?)
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(UdpSocket::local_addr(self)?))
    }
}

#[async_trait]
impl<P: PacketConn + ?Sized> PacketConn for Box<P> {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        (**self).recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], target: &Address) -> Result<usize> {
        (**self).send_to(buf, target).await
    }

    fn local_addr(&self) -> Result<Address> {
        (**self).local_addr()
    }
}

type PeerMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>>;

#[derive(Debug, Clone, Copy)]
struct UdpListenerSettings {
    backlog: usize,
    read_buffer_size: usize,
    read_queue_size: usize,
    ttl: Duration,
    tproxy: bool,
}

impl UdpListenerSettings {
    fn from_metadata(md: &Metadata) -> Self {
        let positive = |key: &str, default: usize| match md.get_int(key) {
            n if n > 0 => n as usize,
            _ => default,
        };
        let ttl = md.get_duration("ttl");
        Self {
            backlog: positive("backlog", DEFAULT_BACKLOG),
            read_buffer_size: positive("readBufferSize", DEFAULT_READ_BUFFER_SIZE),
            read_queue_size: positive("readQueueSize", DEFAULT_READ_QUEUE_SIZE),
            ttl: if ttl.is_zero() { DEFAULT_TTL } else { ttl },
            tproxy: md.get_bool("tproxy"),
        }
    }
}

/// The `redu` listener: one virtual connection per client address.
///
/// Proxy-protocol and connection limiting do not apply to datagrams; the
/// remaining decorators wrap every connection as it is accepted.
pub struct UdpConnListener {
    local: SocketAddr,
    service: String,
    pipeline: Pipeline,
    queue: tokio::sync::Mutex<mpsc::Receiver<Result<Conn>>>,
    closed: CancellationToken,
}

impl UdpConnListener {
    pub async fn listen(opts: ListenerOptions, md: Metadata) -> Result<Box<dyn Listener>> {
        let settings = UdpListenerSettings::from_metadata(&md);
        let addr = bind_addr(&opts.addr)?;
        let socket = Arc::new(bind_udp(addr, settings.tproxy)?);
        let local = socket.local_addr()?;

        let (tx, rx) = mpsc::channel(settings.backlog);
        let closed = CancellationToken::new();
        tokio::spawn(listen_loop(socket, local, settings, tx, closed.clone()));

        debug!(service = %opts.service, tproxy = settings.tproxy, "udp listener on {}", local);
        Ok(Box::new(Self {
            local,
            service: opts.service,
            pipeline: opts.pipeline,
            queue: tokio::sync::Mutex::new(rx),
            closed,
        }))
    }
}

fn bind_udp(addr: SocketAddr, tproxy: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if tproxy {
        set_transparent(&socket)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
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

async fn listen_loop(
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    settings: UdpListenerSettings,
    queue: mpsc::Sender<Result<Conn>>,
    closed: CancellationToken,
) {
    let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; settings.read_buffer_size];

    loop {
        let (n, peer) = tokio::select! {
            _ = closed.cancelled() => return,
            r = socket.recv_from(&mut buf) => match r {
                Ok(v) => v,
                Err(e) => {
                    let _ = queue.try_send(Err(e.into()));
                    return;
                }
            },
        };
        let data = Bytes::copy_from_slice(&buf[..n]);

        let existing = peers.lock().get(&peer).cloned();
        if let Some(tx) = existing {
            if tx.try_send(data).is_err() {
                debug!("udp read queue of {} is full, datagram dropped", peer);
            }
            continue;
        }

        let (tx, rx) = mpsc::channel(settings.read_queue_size);
        let _ = tx.try_send(data);
        peers.lock().insert(peer, tx);

        let conn = UdpPeerConn {
            socket: socket.clone(),
            peer,
            rx,
            pending: Bytes::new(),
            peers: peers.clone(),
            ttl: settings.ttl,
            idle: Box::pin(tokio::time::sleep(settings.ttl)),
        };
        let conn = Conn::new(Box::new(conn), Address::Socket(peer), Address::Socket(local));
        if queue.try_send(Ok(conn)).is_err() {
            warn!("connection queue is full, client {} discarded", peer);
        }
    }
}

#[async_trait]
impl Listener for UdpConnListener {
    async fn accept(&self) -> Result<Conn> {
        let mut queue = self.queue.lock().await;
        loop {
            let item = tokio::select! {
                _ = self.closed.cancelled() => return Err(Error::Closed),
                item = queue.recv() => item.ok_or(Error::Closed)?,
            };

            match self.pipeline.wrap_conn(item?) {
                Ok(conn) => return Ok(conn),
                Err(Error::Rejected(reason)) => debug!(service = %self.service, "{}", reason),
                Err(e) => return Err(e),
            }
        }
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(self.local))
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// A client of the UDP listener seen as a byte stream.
///
/// Each read yields at most one datagram, each write sends one. The
/// connection reads as closed after `ttl` without traffic from the client.
pub struct UdpPeerConn {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    peers: PeerMap,
    ttl: Duration,
    idle: Pin<Box<Sleep>>,
}

impl AsyncRead for UdpPeerConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pending.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => {
                    let deadline = Instant::now() + self.ttl;
                    self.idle.as_mut().reset(deadline);
                    self.pending = data;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => {
                    return match self.idle.as_mut().poll(cx) {
                        Poll::Ready(()) => Poll::Ready(Ok(())),
                        Poll::Pending => Poll::Pending,
                    };
                }
            }
        }

        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpPeerConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.socket.poll_send_to(cx, buf, self.peer)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for UdpPeerConn {
    fn drop(&mut self) {
        self.peers.lock().remove(&self.peer);
    }
}
