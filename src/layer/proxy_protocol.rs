//! Proxy-protocol (v1 text and v2 binary) header unwrapping.
//!
//! Headers are read on a per-connection task, so a slow or silent client
//! never holds up `accept` for the others.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::metrics;
use crate::common::{Address, Conn, Result, Rewind, Stream};
use crate::error::Error;
use crate::transport::Listener;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const QUEUE_SIZE: usize = 128;

const V1_PREFIX: &[u8] = b"PROXY ";
const V1_MAX_LEN: usize = 107;
const V2_SIGNATURE: &[u8] = b"\r\n\r\n\0\r\nQUIT\n";
const V2_HEADER_LEN: usize = 16;

/// What to do with connections that lack a valid header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyPolicy {
    /// No header is expected
    #[default]
    Off,
    /// Use the header when present, otherwise pass the bytes through
    Lenient,
    /// Close connections without a valid header
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyProtocolConfig {
    pub policy: ProxyPolicy,
    /// Bound on reading the header
    pub timeout: Duration,
}

impl Default for ProxyProtocolConfig {
    fn default() -> Self {
        Self {
            policy: ProxyPolicy::Off,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Outcome of looking at the head of a connection.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Parsed {
    /// More bytes needed
    Incomplete,
    /// The connection does not start with a header
    NotProxy,
    Malformed(String),
    /// A complete header of `len` bytes; `source` is absent for LOCAL/UNKNOWN
    Header {
        source: Option<SocketAddr>,
        len: usize,
    },
}

fn is_prefix(buf: &[u8], of: &[u8]) -> bool {
    let n = buf.len().min(of.len());
    buf[..n] == of[..n]
}

pub(crate) fn parse_header(buf: &[u8]) -> Parsed {
    if is_prefix(buf, V1_PREFIX) {
        if buf.len() < V1_PREFIX.len() {
            return Parsed::Incomplete;
        }
        return parse_v1(buf);
    }
    if is_prefix(buf, V2_SIGNATURE) {
        if buf.len() < V2_HEADER_LEN {
            return Parsed::Incomplete;
        }
        return parse_v2(buf);
    }
    Parsed::NotProxy
}

fn parse_v1(buf: &[u8]) -> Parsed {
    let window = &buf[..buf.len().min(V1_MAX_LEN)];
    let end = match window.windows(2).position(|w| w == b"\r\n") {
        Some(i) => i,
        None if buf.len() >= V1_MAX_LEN => return Parsed::Malformed("v1 header too long".into()),
        None => return Parsed::Incomplete,
    };
    let Ok(line) = std::str::from_utf8(&buf[..end]) else {
        return Parsed::Malformed("v1 header is not ascii".into());
    };

    let parts: Vec<&str> = line.split(' ').collect();
    let len = end + 2;
    match parts.get(1).copied() {
        Some("UNKNOWN") => Parsed::Header { source: None, len },
        Some(proto @ ("TCP4" | "TCP6")) if parts.len() == 6 => {
            let ip: IpAddr = match parts[2].parse() {
                Ok(ip) => ip,
                Err(_) => return Parsed::Malformed(format!("bad source address {}", parts[2])),
            };
            if (proto == "TCP4") != ip.is_ipv4() {
                return Parsed::Malformed(format!("{} with source {}", proto, ip));
            }
            match parts[4].parse::<u16>() {
                Ok(port) => Parsed::Header {
                    source: Some(SocketAddr::new(ip, port)),
                    len,
                },
                Err(_) => Parsed::Malformed(format!("bad source port {}", parts[4])),
            }
        }
        _ => Parsed::Malformed(format!("bad v1 header: {}", line)),
    }
}

fn parse_v2(buf: &[u8]) -> Parsed {
    let ver_cmd = buf[12];
    if ver_cmd >> 4 != 2 {
        return Parsed::Malformed(format!("bad v2 version {}", ver_cmd >> 4));
    }
    let family = buf[13];
    let payload_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let len = V2_HEADER_LEN + payload_len;
    if buf.len() < len {
        return Parsed::Incomplete;
    }
    let payload = &buf[V2_HEADER_LEN..len];

    match ver_cmd & 0x0f {
        // LOCAL: health checks from the proxy itself
        0 => Parsed::Header { source: None, len },
        1 => {
            let source = match family >> 4 {
                1 if payload.len() >= 12 => {
                    let ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
                    let port = u16::from_be_bytes([payload[8], payload[9]]);
                    Some(SocketAddr::new(ip.into(), port))
                }
                2 if payload.len() >= 36 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&payload[..16]);
                    let port = u16::from_be_bytes([payload[32], payload[33]]);
                    Some(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
                }
                1 | 2 => return Parsed::Malformed("v2 address block too short".into()),
                // UNSPEC or UNIX: keep the physical address
                _ => None,
            };
            Parsed::Header { source, len }
        }
        cmd => Parsed::Malformed(format!("bad v2 command {}", cmd)),
    }
}

async fn read_header(stream: &mut Stream, buf: &mut BytesMut) -> Result<Parsed> {
    loop {
        match parse_header(buf) {
            Parsed::Incomplete => {}
            parsed => return Ok(parsed),
        }
        if stream.read_buf(buf).await? == 0 {
            return Ok(if buf.is_empty() {
                Parsed::NotProxy
            } else {
                Parsed::Malformed("connection closed inside header".into())
            });
        }
    }
}

/// Read the header of `conn` and apply it according to the policy.
pub(crate) async fn unwrap_conn(mut conn: Conn, cfg: ProxyProtocolConfig) -> Result<Conn> {
    let mut buf = BytesMut::with_capacity(256);
    let strict = cfg.policy == ProxyPolicy::Strict;

    let parsed = tokio::time::timeout(cfg.timeout, read_header(&mut conn.stream, &mut buf)).await;
    let parsed = match parsed {
        Ok(r) => r?,
        Err(_) if strict => return Err(Error::Timeout),
        Err(_) => {
            debug!(remote = %conn.peer, "proxy protocol: no header before timeout");
            Parsed::NotProxy
        }
    };

    match parsed {
        Parsed::Header { source, len } => {
            let rest = buf.split_off(len);
            if let Some(source) = source {
                conn.peer = Address::Socket(source);
            }
            buf = rest;
        }
        Parsed::NotProxy if strict => {
            return Err(Error::Rejected("missing proxy protocol header".into()))
        }
        Parsed::Malformed(reason) if strict => return Err(Error::Protocol(reason)),
        Parsed::Malformed(reason) => debug!(remote = %conn.peer, "proxy protocol: {}", reason),
        Parsed::NotProxy | Parsed::Incomplete => {}
    }

    if buf.is_empty() {
        return Ok(conn);
    }
    let prefix = buf.freeze();
    Ok(conn.map_stream(|s| Box::new(Rewind::new(prefix, s))))
}

/// Accepts from the inner listener in the background and hands out
/// connections whose header has been read.
pub(crate) struct ProxyProtocolListener {
    inner: Arc<dyn Listener>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Result<Conn>>>,
    closed: CancellationToken,
}

impl ProxyProtocolListener {
    pub fn new(inner: Box<dyn Listener>, cfg: ProxyProtocolConfig, service: &str) -> Self {
        let inner: Arc<dyn Listener> = Arc::from(inner);
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        tokio::spawn(accept_loop(inner.clone(), tx, cfg, service.to_string()));
        Self {
            inner,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }
}

async fn accept_loop(
    inner: Arc<dyn Listener>,
    tx: mpsc::Sender<Result<Conn>>,
    cfg: ProxyProtocolConfig,
    service: String,
) {
    loop {
        let accepted = tokio::select! {
            // Wrapper dropped without close
            _ = tx.closed() => return,
            r = inner.accept() => r,
        };
        let conn = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let tx = tx.clone();
        let service = service.clone();
        tokio::spawn(async move {
            let remote = conn.peer.clone();
            match unwrap_conn(conn, cfg).await {
                Ok(conn) => {
                    let _ = tx.send(Ok(conn)).await;
                }
                Err(e) => {
                    metrics::SERVICE_ERRORS_TOTAL.with_label_values(&[&service]).inc();
                    warn!(service = %service, remote = %remote, "proxy protocol: {}", e);
                }
            }
        });
    }
}

#[async_trait]
impl Listener for ProxyProtocolListener {
    async fn accept(&self) -> Result<Conn> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Closed),
            item = rx.recv() => item.unwrap_or(Err(Error::Closed)),
        }
    }

    fn local_addr(&self) -> Result<Address> {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn v2(cmd: u8, family: u8, payload: &[u8]) -> Vec<u8> {
        let mut h = V2_SIGNATURE.to_vec();
        h.push(0x20 | cmd);
        h.push(family);
        h.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        h.extend_from_slice(payload);
        h
    }

    #[test]
    fn test_parse_v1() {
        let h = b"PROXY TCP4 192.0.2.1 198.51.100.1 56324 443\r\nGET";
        assert_eq!(
            parse_header(h),
            Parsed::Header {
                source: Some("192.0.2.1:56324".parse().unwrap()),
                len: h.len() - 3,
            }
        );
        assert_eq!(
            parse_header(b"PROXY TCP6 2001:db8::1 2001:db8::2 1 2\r\n"),
            Parsed::Header {
                source: Some("[2001:db8::1]:1".parse().unwrap()),
                len: 40,
            }
        );
        assert_eq!(
            parse_header(b"PROXY UNKNOWN\r\n"),
            Parsed::Header { source: None, len: 15 }
        );
    }

    #[test]
    fn test_parse_v1_partial_and_bad() {
        assert_eq!(parse_header(b""), Parsed::Incomplete);
        assert_eq!(parse_header(b"PRO"), Parsed::Incomplete);
        assert_eq!(parse_header(b"PROXY TCP4 1.2.3.4"), Parsed::Incomplete);
        assert_eq!(parse_header(b"GET / HTTP/1.1\r\n"), Parsed::NotProxy);
        assert!(matches!(
            parse_header(b"PROXY TCP4 ::1 ::1 1 2\r\n"),
            Parsed::Malformed(_)
        ));
        assert!(matches!(
            parse_header(b"PROXY TCP4 1.2.3.4 5.6.7.8 99999 1\r\n"),
            Parsed::Malformed(_)
        ));
        assert!(matches!(
            parse_header(&[b'P', b'R', b'O', b'X', b'Y', b' '].repeat(20)),
            Parsed::Malformed(_)
        ));
    }

    #[test]
    fn test_parse_v2() {
        let mut block = vec![10, 0, 0, 1, 10, 0, 0, 2];
        block.extend_from_slice(&1234u16.to_be_bytes());
        block.extend_from_slice(&80u16.to_be_bytes());
        let h = v2(1, 0x11, &block);
        assert_eq!(
            parse_header(&h),
            Parsed::Header {
                source: Some("10.0.0.1:1234".parse().unwrap()),
                len: 28,
            }
        );
        assert_eq!(parse_header(&h[..20]), Parsed::Incomplete);
        assert_eq!(
            parse_header(&v2(0, 0, &[])),
            Parsed::Header { source: None, len: 16 }
        );

        let mut bad = v2(1, 0x11, &block);
        bad[12] = 0x31;
        assert!(matches!(parse_header(&bad), Parsed::Malformed(_)));
    }

    async fn unwrap_bytes(input: &'static [u8], policy: ProxyPolicy) -> Result<(Conn, Vec<u8>)> {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = client;
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let conn = Conn::new(
            Box::new(server),
            Address::Socket("127.0.0.1:1".parse().unwrap()),
            Address::unspecified(),
        );
        let cfg = ProxyProtocolConfig {
            policy,
            timeout: Duration::from_secs(1),
        };
        let mut conn = unwrap_conn(conn, cfg).await?;
        let mut rest = Vec::new();
        conn.stream.read_to_end(&mut rest).await.unwrap();
        Ok((conn, rest))
    }

    #[tokio::test]
    async fn test_header_consumed_payload_kept() {
        let (conn, rest) = unwrap_bytes(b"PROXY TCP4 192.0.2.7 10.0.0.1 5000 80\r\nhello", ProxyPolicy::Strict)
            .await
            .unwrap();
        assert_eq!(conn.peer, Address::Socket("192.0.2.7:5000".parse().unwrap()));
        assert_eq!(rest, b"hello");
    }

    #[tokio::test]
    async fn test_lenient_passes_through() {
        let (conn, rest) = unwrap_bytes(b"plain bytes", ProxyPolicy::Lenient).await.unwrap();
        assert_eq!(conn.peer, Address::Socket("127.0.0.1:1".parse().unwrap()));
        assert_eq!(rest, b"plain bytes");

        let (_, rest) = unwrap_bytes(b"PROXY BOGUS\r\nxyz", ProxyPolicy::Lenient).await.unwrap();
        assert_eq!(rest, b"PROXY BOGUS\r\nxyz");
    }

    #[tokio::test]
    async fn test_strict_rejects() {
        assert!(matches!(
            unwrap_bytes(b"plain bytes", ProxyPolicy::Strict).await,
            Err(Error::Rejected(_))
        ));
        assert!(matches!(
            unwrap_bytes(b"PROXY BOGUS\r\n", ProxyPolicy::Strict).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_policy() {
        for (policy, rejected) in [(ProxyPolicy::Strict, true), (ProxyPolicy::Lenient, false)] {
            let (_client, server) = tokio::io::duplex(64);
            let conn = Conn::new(Box::new(server), Address::unspecified(), Address::unspecified());
            let cfg = ProxyProtocolConfig {
                policy,
                timeout: Duration::from_secs(10),
            };
            let r = unwrap_conn(conn, cfg).await;
            assert_eq!(matches!(r, Err(Error::Timeout)), rejected);
        }
    }
}
