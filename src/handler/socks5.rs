//! SOCKS5 handler
//!
//! Supports CONNECT and UDP ASSOCIATE. BIND is answered with
//! "command not supported".

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::app::metrics::format_bytes;
use crate::common::{Address, ClientId, Conn, Metadata, Network, Result, Stream};
use crate::error::Error;
use crate::layer::{StatsPacketConn, StatsStream};
use crate::router::Outbound;
use crate::transport::PacketConn;

use super::socks_udp::SocksUdpConn;
use super::udp_relay::UdpRelay;
use super::{relay, Handler, HandlerOptions};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const AUTH_PASSWORD_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

const DEFAULT_UDP_BUFFER_SIZE: usize = 4096;
const MAX_UDP_BUFFER_SIZE: usize = 65535;

/// Read a SOCKS address (ATYP, address, port) from the front of `buf`.
///
/// Returns the address and the number of bytes it took.
pub(super) fn decode_addr(buf: &[u8]) -> Result<(Address, usize)> {
    let short = || Error::Protocol("truncated SOCKS5 address".into());
    let atyp = *buf.first().ok_or_else(short)?;
    let (host_len, addr) = match atyp {
        ATYP_IPV4 => {
            let b: [u8; 4] = buf.get(1..5).ok_or_else(short)?.try_into().map_err(|_| short())?;
            (4, Some(IpAddr::V4(Ipv4Addr::from(b))))
        }
        ATYP_IPV6 => {
            let b: [u8; 16] = buf.get(1..17).ok_or_else(short)?.try_into().map_err(|_| short())?;
            (16, Some(IpAddr::V6(Ipv6Addr::from(b))))
        }
        ATYP_DOMAIN => (1 + *buf.get(1).ok_or_else(short)? as usize, None),
        other => {
            return Err(Error::Protocol(format!(
                "unsupported address type: {}",
                other
            )))
        }
    };

    let port_at = 1 + host_len;
    let port = buf.get(port_at..port_at + 2).ok_or_else(short)?;
    let port = u16::from_be_bytes([port[0], port[1]]);
    let addr = match addr {
        Some(ip) => Address::Socket(SocketAddr::new(ip, port)),
        None => {
            let name = std::str::from_utf8(&buf[2..port_at])
                .map_err(|_| Error::Protocol("SOCKS5 domain name is not UTF-8".into()))?;
            Address::Domain(name.to_string(), port)
        }
    };
    Ok((addr, port_at + 2))
}

/// Append `addr` as ATYP, address, port.
pub(super) fn encode_addr(addr: &Address, buf: &mut BytesMut) -> Result<()> {
    match addr {
        Address::Socket(SocketAddr::V4(v4)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        Address::Socket(SocketAddr::V6(v6)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
        Address::Domain(domain, port) => {
            let len = u8::try_from(domain.len())
                .map_err(|_| Error::InvalidAddress(format!("domain too long: {}", domain)))?;
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(len);
            buf.put_slice(domain.as_bytes());
            buf.put_u16(*port);
        }
        Address::Unix(path) => {
            return Err(Error::InvalidAddress(format!(
                "unix socket {} has no SOCKS5 form",
                path
            )))
        }
    }
    Ok(())
}

async fn read_addr(stream: &mut Stream) -> Result<Address> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let rest = match head[0] {
        ATYP_IPV4 => 4 + 2 - 1,
        ATYP_IPV6 => 16 + 2 - 1,
        ATYP_DOMAIN => head[1] as usize + 2,
        other => {
            write_reply(stream, REP_ATYP_NOT_SUPPORTED, None).await?;
            return Err(Error::Protocol(format!(
                "unsupported address type: {}",
                other
            )));
        }
    };
    let mut buf = vec![0u8; 2 + rest];
    buf[..2].copy_from_slice(&head);
    stream.read_exact(&mut buf[2..]).await?;
    Ok(decode_addr(&buf)?.0)
}

async fn write_reply(stream: &mut Stream, rep: u8, bind: Option<&Address>) -> Result<()> {
    let unspecified = Address::unspecified();
    let mut buf = BytesMut::with_capacity(22);
    buf.put_slice(&[SOCKS5_VERSION, rep, 0x00]);
    encode_addr(bind.unwrap_or(&unspecified), &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

fn connect_failure_reply(e: &Error) -> u8 {
    match e {
        Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        Error::Io(_) | Error::InvalidAddress(_) => REP_HOST_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}

#[derive(Debug, Clone, Copy)]
struct Socks5Settings {
    enable_udp: bool,
    udp_buffer_size: usize,
    read_timeout: Option<Duration>,
}

impl Socks5Settings {
    fn from_metadata(md: &Metadata) -> Self {
        let size = md.get_int("udpBufferSize");
        let udp_buffer_size = if size > 0 {
            (size as usize).min(MAX_UDP_BUFFER_SIZE)
        } else {
            DEFAULT_UDP_BUFFER_SIZE
        };
        let read_timeout = md.get_duration("readTimeout");
        Self {
            enable_udp: md.get_bool("enableUDP"),
            udp_buffer_size,
            read_timeout: (!read_timeout.is_zero()).then_some(read_timeout),
        }
    }
}

struct Request {
    cmd: u8,
    addr: Address,
    client: Option<ClientId>,
}

/// SOCKS5 server side.
pub struct Socks5Handler {
    opts: HandlerOptions,
    settings: Socks5Settings,
}

impl Socks5Handler {
    pub fn new(opts: HandlerOptions, md: &Metadata) -> Self {
        Self {
            opts,
            settings: Socks5Settings::from_metadata(md),
        }
    }

    /// Method negotiation, authentication and the request.
    async fn handshake(&self, stream: &mut Stream) -> Result<Request> {
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;
        if buf[0] != SOCKS5_VERSION {
            return Err(Error::Protocol(format!(
                "Unsupported SOCKS version: {}",
                buf[0]
            )));
        }
        let mut methods = vec![0u8; buf[1] as usize];
        stream.read_exact(&mut methods).await?;

        let selected = match &self.opts.credentials {
            Some(_) if methods.contains(&AUTH_PASSWORD) => AUTH_PASSWORD,
            None if methods.contains(&AUTH_NONE) => AUTH_NONE,
            _ => AUTH_NO_ACCEPTABLE,
        };
        stream.write_all(&[SOCKS5_VERSION, selected]).await?;
        if selected == AUTH_NO_ACCEPTABLE {
            return Err(Error::Protocol("No acceptable auth method".into()));
        }

        let client = if selected == AUTH_PASSWORD {
            Some(self.authenticate(stream).await?)
        } else {
            None
        };

        let mut header = [0u8; 3];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(Error::Protocol("Invalid SOCKS version in request".into()));
        }
        let addr = read_addr(stream).await?;

        Ok(Request {
            cmd: header[1],
            addr,
            client,
        })
    }

    /// Username/password sub-negotiation; the username becomes the client id.
    async fn authenticate(&self, stream: &mut Stream) -> Result<ClientId> {
        let mut ver = [0u8; 2];
        stream.read_exact(&mut ver).await?;
        if ver[0] != AUTH_PASSWORD_VERSION {
            return Err(Error::Protocol("Invalid auth version".into()));
        }
        let mut username = vec![0u8; ver[1] as usize];
        stream.read_exact(&mut username).await?;
        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut password).await?;

        let username = String::from_utf8_lossy(&username).into_owned();
        let password = String::from_utf8_lossy(&password);
        let ok = self
            .opts
            .credentials
            .as_ref()
            .is_some_and(|c| c.verify(&username, &password));

        if !ok {
            stream.write_all(&[AUTH_PASSWORD_VERSION, 0x01]).await?;
            return Err(Error::Rejected(format!("authentication failed for {}", username)));
        }
        stream.write_all(&[AUTH_PASSWORD_VERSION, 0x00]).await?;
        Ok(ClientId::new(username))
    }

    async fn handle_connect(
        &self,
        mut stream: Stream,
        peer: &Address,
        dst: Address,
        client: Option<ClientId>,
    ) -> Result<()> {
        if let Some(bypass) = &self.opts.bypass {
            if bypass.contains(&dst) {
                debug!(service = %self.opts.service, dst = %dst, "bypass");
                return write_reply(&mut stream, REP_NOT_ALLOWED, None).await;
            }
        }

        let start = Instant::now();
        let outbound = match self.opts.dialer.dial(Network::Tcp, &dst.to_string()).await {
            Ok(Outbound::Stream(s)) => s,
            Ok(other) => {
                write_reply(&mut stream, REP_GENERAL_FAILURE, None).await?;
                return Err(Error::Transport(format!(
                    "socks5: wrong connection type {}",
                    other.kind()
                )));
            }
            Err(e) => {
                write_reply(&mut stream, connect_failure_reply(&e), None).await?;
                return Err(e);
            }
        };
        write_reply(&mut stream, REP_SUCCESS, None).await?;

        let stream: Stream = match &self.opts.stats {
            Some(set) => Box::new(StatsStream::new(stream, set.stats(client.as_ref()))),
            None => stream,
        };

        info!(service = %self.opts.service, client = ?client, "{} <-> {}", peer, dst);
        let (up, down) = relay(stream, outbound).await;
        info!(
            service = %self.opts.service,
            "{} >-< {} (↑{} ↓{} {:?})",
            peer,
            dst,
            format_bytes(up),
            format_bytes(down),
            start.elapsed()
        );
        Ok(())
    }

    async fn handle_udp(
        &self,
        mut stream: Stream,
        peer: &Address,
        local: &Address,
        client: Option<ClientId>,
    ) -> Result<()> {
        if !self.settings.enable_udp {
            warn!(service = %self.opts.service, remote = %peer, "socks5: UDP relay is disabled");
            return write_reply(&mut stream, REP_NOT_ALLOWED, None).await;
        }

        // Same family as the control connection so the reply address is
        // reachable by the client.
        let local_ip = local.ip();
        let wildcard = match local_ip {
            Some(IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let socket = match UdpSocket::bind(SocketAddr::new(wildcard, 0)).await {
            Ok(s) => s,
            Err(e) => {
                write_reply(&mut stream, REP_GENERAL_FAILURE, None).await?;
                return Err(e.into());
            }
        };
        let bound = socket.local_addr()?;
        let reply_addr = Address::Socket(SocketAddr::new(local_ip.unwrap_or(wildcard), bound.port()));
        write_reply(&mut stream, REP_SUCCESS, Some(&reply_addr)).await?;
        debug!(service = %self.opts.service, bind = %bound, "bind on {} OK", bound);

        let outbound = match self.opts.dialer.dial(Network::Udp, "").await? {
            Outbound::Packet(pc) => pc,
            Outbound::Stream(_) => {
                return Err(Error::Transport("socks5: wrong connection type".into()));
            }
        };

        let client_side: Box<dyn PacketConn> = match &self.opts.stats {
            Some(set) => Box::new(StatsPacketConn::new(socket, set.stats(client.as_ref()))),
            None => Box::new(socket),
        };
        let relay = UdpRelay::new(
            SocksUdpConn::new(client_side, self.settings.udp_buffer_size + 262),
            outbound,
        )
        .with_bypass(self.opts.bypass.clone())
        .with_buffer_size(self.settings.udp_buffer_size);

        let service = self.opts.service.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = relay.run().await {
                debug!(service = %service, "udp relay ended: {}", e);
            }
        });

        let start = Instant::now();
        debug!(service = %self.opts.service, client = ?client, "{} <-> {}", peer, bound);
        let _ = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await;
        task.abort();
        let _ = task.await;
        debug!(
            service = %self.opts.service,
            "{} >-< {} ({:?})",
            peer,
            bound,
            start.elapsed()
        );
        Ok(())
    }
}

#[async_trait]
impl Handler for Socks5Handler {
    async fn handle(&self, conn: Conn) -> Result<()> {
        let Conn {
            mut stream,
            peer,
            local,
            ..
        } = conn;

        let request = match self.settings.read_timeout {
            Some(t) => tokio::time::timeout(t, self.handshake(&mut stream)).await??,
            None => self.handshake(&mut stream).await?,
        };

        match request.cmd {
            CMD_CONNECT => {
                self.handle_connect(stream, &peer, request.addr, request.client)
                    .await
            }
            CMD_UDP_ASSOCIATE => self.handle_udp(stream, &peer, &local, request.client).await,
            CMD_BIND => {
                write_reply(&mut stream, REP_CMD_NOT_SUPPORTED, None).await?;
                Err(Error::Unsupported("socks5 BIND".into()))
            }
            other => {
                write_reply(&mut stream, REP_CMD_NOT_SUPPORTED, None).await?;
                Err(Error::Protocol(format!("Unsupported command: {}", other)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Credentials;
    use crate::router::Dialer;
    use crate::stats::{Kind, StatsSet};
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    async fn serve(handler: Socks5Handler) -> (TcpStream, JoinHandle<Result<()>>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(ln.local_addr().unwrap()).await.unwrap();
        let (server, peer) = ln.accept().await.unwrap();
        let local = server.local_addr().unwrap();
        let conn = Conn::new(Box::new(server), peer.into(), local.into());
        let task = tokio::spawn(async move { handler.handle(conn).await });
        (client, task)
    }

    async fn udp_echo() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = sock.recv_from(&mut buf).await {
                let _ = sock.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    fn udp_handler(opts: HandlerOptions) -> Socks5Handler {
        Socks5Handler::new(opts, &Metadata::new().with("enableUDP", true))
    }

    /// Greeting without auth plus a request; returns the reply.
    async fn request(client: &mut TcpStream, cmd: u8, dst: SocketAddr) -> Vec<u8> {
        client.write_all(&[5, 1, AUTH_NONE]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, AUTH_NONE]);

        let mut req = BytesMut::from(&[5, cmd, 0][..]);
        encode_addr(&Address::Socket(dst), &mut req).unwrap();
        client.write_all(&req).await.unwrap();
        read_reply(client).await
    }

    async fn read_reply(client: &mut TcpStream) -> Vec<u8> {
        let mut reply = vec![0u8; 10];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        reply
    }

    fn udp_datagram(dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        encode_addr(&Address::Socket(dst), &mut buf).unwrap();
        buf.put_slice(payload);
        buf.to_vec()
    }

    fn any_addr() -> SocketAddr {
        "0.0.0.0:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_udp_associate_round_trip() {
        let echo = udp_echo().await;
        let (mut control, task) = serve(udp_handler(HandlerOptions::new("s5"))).await;

        let reply = request(&mut control, CMD_UDP_ASSOCIATE, any_addr()).await;
        assert_eq!(&reply[..4], &[5, REP_SUCCESS, 0, ATYP_IPV4]);
        // Reply carries the control connection's local IP, not 0.0.0.0
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
        let relay = SocketAddr::new([127, 0, 0, 1].into(), u16::from_be_bytes([reply[8], reply[9]]));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for payload in [&b"x"[..], &[0xAB; 1000][..]] {
            client.send_to(&udp_datagram(echo, payload), relay).await.unwrap();
            let mut buf = [0u8; 4096];
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], &udp_datagram(echo, payload)[..]);
        }

        drop(control);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_udp_associate_relays_to_ipv6_destination() {
        // Hosts without IPv6 cannot bind [::1]
        let Ok(sock) = UdpSocket::bind("[::1]:0").await else {
            return;
        };
        let echo = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = sock.recv_from(&mut buf).await {
                let _ = sock.send_to(&buf[..n], from).await;
            }
        });

        let (mut control, task) = serve(udp_handler(HandlerOptions::new("s5"))).await;
        let reply = request(&mut control, CMD_UDP_ASSOCIATE, any_addr()).await;
        assert_eq!(reply[1], REP_SUCCESS);
        let relay = SocketAddr::new([127, 0, 0, 1].into(), u16::from_be_bytes([reply[8], reply[9]]));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&udp_datagram(echo, b"v6"), relay).await.unwrap();
        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &udp_datagram(echo, b"v6")[..]);

        drop(control);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_closing_control_tears_down_association() {
        let echo = udp_echo().await;
        let stats = Arc::new(StatsSet::new());
        let (mut control, task) =
            serve(udp_handler(HandlerOptions::new("s5").with_stats(stats.clone()))).await;

        let reply = request(&mut control, CMD_UDP_ASSOCIATE, any_addr()).await;
        let relay = SocketAddr::new([127, 0, 0, 1].into(), u16::from_be_bytes([reply[8], reply[9]]));
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 64];
        client.send_to(&udp_datagram(echo, b"live"), relay).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let anon = stats.stats(None);
        assert_eq!(anon.get(Kind::CurrentConns), 1);
        assert_eq!(anon.get(Kind::TotalConns), 1);

        drop(control);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(anon.get(Kind::CurrentConns), 0);

        // The relay socket is gone: nothing comes back any more
        let _ = client.send_to(&udp_datagram(echo, b"late"), relay).await;
        let late = tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
        assert!(!matches!(late, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn test_udp_disabled_replies_not_allowed() {
        let handler = Socks5Handler::new(HandlerOptions::new("s5"), &Metadata::new());
        let (mut control, task) = serve(handler).await;
        let reply = request(&mut control, CMD_UDP_ASSOCIATE, any_addr()).await;
        assert_eq!(reply[1], REP_NOT_ALLOWED);
        assert!(task.await.unwrap().is_ok());
    }

    struct StreamOnlyDialer;

    #[async_trait]
    impl Dialer for StreamOnlyDialer {
        async fn dial(&self, _network: Network, _addr: &str) -> Result<Outbound> {
            let (a, _b) = tokio::io::duplex(16);
            Ok(Outbound::Stream(Box::new(a)))
        }
    }

    #[tokio::test]
    async fn test_wrong_connection_type_is_fatal() {
        let opts = HandlerOptions::new("s5").with_dialer(Arc::new(StreamOnlyDialer));
        let (mut control, task) = serve(udp_handler(opts)).await;
        let reply = request(&mut control, CMD_UDP_ASSOCIATE, any_addr()).await;
        assert_eq!(reply[1], REP_SUCCESS);

        let err = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_connect_relays_with_client_stats() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = server.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = server.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let stats = Arc::new(StatsSet::new());
        let opts = HandlerOptions::new("s5")
            .with_credentials(Credentials::new().with_user("alice", "pw"))
            .with_stats(stats.clone());
        let (mut client, task) = serve(Socks5Handler::new(opts, &Metadata::new())).await;

        client.write_all(&[5, 1, AUTH_PASSWORD]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, AUTH_PASSWORD]);
        client.write_all(&[1, 5, b'a', b'l', b'i', b'c', b'e', 2, b'p', b'w']).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [1, 0]);

        let mut req = BytesMut::from(&[5, CMD_CONNECT, 0][..]);
        encode_addr(&Address::Socket(dst), &mut req).unwrap();
        client.write_all(&req).await.unwrap();
        assert_eq!(read_reply(&mut client).await[1], REP_SUCCESS);

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let alice = stats.stats(Some(&ClientId::new("alice")));
        assert_eq!(alice.get(Kind::TotalConns), 1);
        assert_eq!(alice.get(Kind::CurrentConns), 0);
        assert_eq!(alice.get(Kind::InputBytes), 5);
        assert_eq!(alice.get(Kind::OutputBytes), 5);
    }

    #[tokio::test]
    async fn test_bad_password_rejected() {
        let opts = HandlerOptions::new("s5").with_credentials(Credentials::new().with_user("alice", "pw"));
        let (mut client, task) = serve(Socks5Handler::new(opts, &Metadata::new())).await;
        client.write_all(&[5, 1, AUTH_PASSWORD]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client.write_all(&[1, 5, b'a', b'l', b'i', b'c', b'e', 1, b'x']).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [1, 1]);
        assert!(matches!(task.await.unwrap(), Err(Error::Rejected(_))));
    }

    #[tokio::test]
    async fn test_bind_not_supported() {
        let (mut client, task) = serve(Socks5Handler::new(HandlerOptions::new("s5"), &Metadata::new())).await;
        let reply = request(&mut client, CMD_BIND, any_addr()).await;
        assert_eq!(reply[1], REP_CMD_NOT_SUPPORTED);
        assert!(task.await.unwrap().is_err());
    }

    #[test]
    fn test_addr_codec() {
        let mut buf = BytesMut::new();
        encode_addr(&Address::domain("example.com", 443), &mut buf).unwrap();
        let (addr, n) = decode_addr(&buf).unwrap();
        assert_eq!(addr, Address::domain("example.com", 443));
        assert_eq!(n, buf.len());

        assert!(encode_addr(&Address::Unix("/tmp/s".into()), &mut buf).is_err());
        assert!(decode_addr(&[ATYP_DOMAIN, 5, b'a']).is_err());
    }

    #[test]
    fn test_non_utf8_domain_rejected() {
        let raw = [ATYP_DOMAIN, 3, b'a', 0xFF, b'b', 0, 53];
        assert!(matches!(decode_addr(&raw), Err(Error::Protocol(_))));
    }
}
