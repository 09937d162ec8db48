//! SOCKS5 UDP datagrams
//!
//! Every datagram between the client and the relay carries
//!
//! ```text
//! +-----+------+------+----------+----------+----------+
//! | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +-----+------+------+----------+----------+----------+
//! |  2  |  1   |  1   | Variable |    2     | Variable |
//! +-----+------+------+----------+----------+----------+
//! ```

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::common::{Address, Result};
use crate::error::Error;
use crate::transport::PacketConn;

use super::socks5::{decode_addr, encode_addr};

/// Header in front of every SOCKS5 UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    /// Fragment number, 0 for a standalone datagram
    pub frag: u8,
    pub addr: Address,
}

impl UdpHeader {
    pub fn new(addr: Address) -> Self {
        Self { frag: 0, addr }
    }

    /// Parse the header, returning it and its length.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 4 {
            return Err(Error::Protocol("short SOCKS5 UDP header".into()));
        }
        let frag = buf[2];
        let (addr, n) = decode_addr(&buf[3..])?;
        Ok((Self { frag, addr }, 3 + n))
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(0);
        buf.put_u8(self.frag);
        encode_addr(&self.addr, buf)
    }
}

/// Client side of a UDP association.
///
/// `recv_from` strips the header and reports the destination the client
/// asked for; `send_to` prepends a header naming the source and sends the
/// datagram to the client.
pub struct SocksUdpConn<P> {
    inner: P,
    buffer_size: usize,
    /// Client address, learnt from the first datagram
    client: Mutex<Option<Address>>,
}

impl<P: PacketConn> SocksUdpConn<P> {
    pub fn new(inner: P, buffer_size: usize) -> Self {
        Self {
            inner,
            buffer_size,
            client: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<P: PacketConn> PacketConn for SocksUdpConn<P> {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let mut raw = vec![0u8; self.buffer_size];
        loop {
            let (n, from) = self.inner.recv_from(&mut raw).await?;
            let (header, hlen) = match UdpHeader::decode(&raw[..n]) {
                Ok(h) => h,
                Err(e) => {
                    debug!(client = %from, "drop datagram: {}", e);
                    continue;
                }
            };
            if header.frag != 0 {
                debug!(client = %from, frag = header.frag, "drop fragmented datagram");
                continue;
            }

            let payload = &raw[hlen..n];
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            *self.client.lock() = Some(from);
            return Ok((len, header.addr));
        }
    }

    async fn send_to(&self, buf: &[u8], source: &Address) -> Result<usize> {
        let client = self
            .client
            .lock()
            .clone()
            .ok_or_else(|| Error::Protocol("UDP client address not known yet".into()))?;

        let mut datagram = BytesMut::with_capacity(buf.len() + 22);
        UdpHeader::new(source.clone()).encode(&mut datagram)?;
        datagram.put_slice(buf);
        self.inner.send_to(&datagram, &client).await?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> Result<Address> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn datagram(frag: u8, addr: Address, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        UdpHeader { frag, addr }.encode(&mut buf).unwrap();
        buf.put_slice(payload);
        buf.to_vec()
    }

    #[test]
    fn test_header_layouts() {
        let v4 = datagram(0, Address::Socket("1.2.3.4:53".parse().unwrap()), b"");
        assert_eq!(v4, [0, 0, 0, 1, 1, 2, 3, 4, 0, 53]);

        let domain = datagram(0, Address::domain("a.io", 80), b"x");
        assert_eq!(domain, [0, 0, 0, 3, 4, b'a', b'.', b'i', b'o', 0, 80, b'x']);

        let (h, n) = UdpHeader::decode(&domain).unwrap();
        assert_eq!(h, UdpHeader::new(Address::domain("a.io", 80)));
        assert_eq!(&domain[n..], b"x");

        let v6 = datagram(0, Address::Socket("[::1]:443".parse().unwrap()), b"");
        assert_eq!(v6.len(), 3 + 1 + 16 + 2);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(UdpHeader::decode(&[0, 0]).is_err());
        assert!(UdpHeader::decode(&[0, 0, 0, 9, 1, 2]).is_err());
        // IPv4 without the port
        assert!(UdpHeader::decode(&[0, 0, 0, 1, 1, 2, 3, 4]).is_err());
    }

    #[tokio::test]
    async fn test_conn_strips_and_adds_headers() {
        let relay = SocksUdpConn::new(UdpSocket::bind("127.0.0.1:0").await.unwrap(), 1500);
        let relay_addr = relay.local_addr().unwrap().as_socket().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Not an association datagram, then a fragment: both dropped
        client.send_to(b"junk", relay_addr).await.unwrap();
        let target = Address::Socket("10.0.0.1:9000".parse().unwrap());
        client
            .send_to(&datagram(1, target.clone(), b"frag"), relay_addr)
            .await
            .unwrap();
        client
            .send_to(&datagram(0, target.clone(), b"hello"), relay_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, dst) = tokio::time::timeout(Duration::from_secs(2), relay.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(dst, target);

        relay.send_to(b"world", &target).await.unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &datagram(0, target, b"world")[..]);
    }

    #[tokio::test]
    async fn test_send_before_client_known_fails() {
        let relay = SocksUdpConn::new(UdpSocket::bind("127.0.0.1:0").await.unwrap(), 1500);
        let r = relay
            .send_to(b"x", &Address::Socket("127.0.0.1:1".parse().unwrap()))
            .await;
        assert!(r.is_err());
    }
}
