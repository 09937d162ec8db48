use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::{Address, Conn, Result, Stream};
use crate::stats::{Kind, Stats};
use crate::transport::{Listener, PacketConn};

pub(super) fn instrument(conn: Conn, stats: Arc<Stats>) -> Conn {
    conn.map_stream(|inner| Box::new(StatsStream::new(inner, stats)))
}

pub(super) struct StatsListener {
    inner: Box<dyn Listener>,
    stats: Arc<Stats>,
}

impl StatsListener {
    pub fn new(inner: Box<dyn Listener>, stats: Arc<Stats>) -> Self {
        Self { inner, stats }
    }
}

#[async_trait]
impl Listener for StatsListener {
    async fn accept(&self) -> Result<Conn> {
        let conn = self.inner.accept().await?;
        Ok(instrument(conn, self.stats.clone()))
    }

    fn local_addr(&self) -> Result<Address> {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Stream counting its traffic into a [`Stats`].
///
/// Counts one connection while alive.
pub struct StatsStream<S> {
    inner: S,
    stats: Arc<Stats>,
}

impl<S> StatsStream<S> {
    pub fn new(inner: S, stats: Arc<Stats>) -> Self {
        stats.add(Kind::TotalConns, 1);
        stats.add(Kind::CurrentConns, 1);
        Self { inner, stats }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for StatsStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let r = Pin::new(&mut self.inner).poll_read(cx, buf);
        match &r {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                self.stats.add(Kind::InputBytes, n as i64);
            }
            Poll::Ready(Err(_)) => self.stats.add(Kind::TotalErrs, 1),
            Poll::Pending => {}
        }
        r
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for StatsStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let r = Pin::new(&mut self.inner).poll_write(cx, buf);
        match &r {
            Poll::Ready(Ok(n)) => self.stats.add(Kind::OutputBytes, *n as i64),
            Poll::Ready(Err(_)) => self.stats.add(Kind::TotalErrs, 1),
            Poll::Pending => {}
        }
        r
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S> Drop for StatsStream<S> {
    fn drop(&mut self) {
        self.stats.add(Kind::CurrentConns, -1);
    }
}

/// Datagram counterpart of [`StatsStream`]: counts one association while
/// alive and the bytes of every datagram.
pub struct StatsPacketConn<P> {
    inner: P,
    stats: Arc<Stats>,
}

impl<P> StatsPacketConn<P> {
    pub fn new(inner: P, stats: Arc<Stats>) -> Self {
        stats.add(Kind::TotalConns, 1);
        stats.add(Kind::CurrentConns, 1);
        Self { inner, stats }
    }
}

#[async_trait]
impl<P: PacketConn> PacketConn for StatsPacketConn<P> {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let r = self.inner.recv_from(buf).await;
        match &r {
            Ok((n, _)) => self.stats.add(Kind::InputBytes, *n as i64),
            Err(_) => self.stats.add(Kind::TotalErrs, 1),
        }
        r
    }

    async fn send_to(&self, buf: &[u8], target: &Address) -> Result<usize> {
        let r = self.inner.send_to(buf, target).await;
        match &r {
            Ok(n) => self.stats.add(Kind::OutputBytes, *n as i64),
            Err(_) => self.stats.add(Kind::TotalErrs, 1),
        }
        r
    }

    fn local_addr(&self) -> Result<Address> {
        self.inner.local_addr()
    }
}

impl<P> Drop for StatsPacketConn<P> {
    fn drop(&mut self) {
        self.stats.add(Kind::CurrentConns, -1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_stream_counters() {
        let stats = Arc::new(Stats::new());
        let (mut peer, local) = tokio::io::duplex(64);
        let mut s = StatsStream::new(local, stats.clone());
        assert_eq!(stats.get(Kind::CurrentConns), 1);

        peer.write_all(b"12345").await.unwrap();
        let mut buf = [0u8; 5];
        s.read_exact(&mut buf).await.unwrap();
        s.write_all(b"ab").await.unwrap();

        assert_eq!(stats.get(Kind::InputBytes), 5);
        assert_eq!(stats.get(Kind::OutputBytes), 2);
        drop(s);
        assert_eq!(stats.get(Kind::CurrentConns), 0);
        assert_eq!(stats.get(Kind::TotalConns), 1);
    }

    #[tokio::test]
    async fn test_packet_conn_counters() {
        let stats = Arc::new(Stats::new());
        let a = StatsPacketConn::new(UdpSocket::bind("127.0.0.1:0").await.unwrap(), stats.clone());
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = Address::Socket(b.local_addr().unwrap());

        a.send_to(b"ping", &b_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (_, from) = b.recv_from(&mut buf).await.unwrap();
        b.send_to(b"pong!", from).await.unwrap();
        let (n, _) = a.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 5);

        assert_eq!(stats.get(Kind::OutputBytes), 4);
        assert_eq!(stats.get(Kind::InputBytes), 5);
        assert_eq!(stats.get(Kind::CurrentConns), 1);
        drop(a);
        assert_eq!(stats.get(Kind::CurrentConns), 0);
    }
}
