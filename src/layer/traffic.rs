use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use crate::common::{Address, Conn, Result, Stream};
use crate::limiter::{TokenBucket, TrafficLimiter};
use crate::transport::Listener;

/// Throttle `conn` with the buckets `limiter` assigns to its peer.
pub(super) fn limit(conn: Conn, limiter: &dyn TrafficLimiter) -> Conn {
    let read = limiter.inbound(&conn.peer).map(Throttle::new);
    let write = limiter.outbound(&conn.peer).map(Throttle::new);
    if read.is_none() && write.is_none() {
        return conn;
    }
    conn.map_stream(|inner| Box::new(LimitedStream { inner, read, write }))
}

pub(super) struct TrafficListener {
    inner: Box<dyn Listener>,
    limiter: Arc<dyn TrafficLimiter>,
}

impl TrafficListener {
    pub fn new(inner: Box<dyn Listener>, limiter: Arc<dyn TrafficLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl Listener for TrafficListener {
    async fn accept(&self) -> Result<Conn> {
        let conn = self.inner.accept().await?;
        Ok(limit(conn, self.limiter.as_ref()))
    }

    fn local_addr(&self) -> Result<Address> {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Tokens taken from a bucket but not spent yet.
struct Throttle {
    bucket: Arc<TokenBucket>,
    credit: usize,
    delay: Option<Pin<Box<Sleep>>>,
}

impl Throttle {
    fn new(bucket: Arc<TokenBucket>) -> Self {
        Self {
            bucket,
            credit: 0,
            delay: None,
        }
    }

    /// Wait for permission to move up to `want` bytes.
    fn poll_credit(&mut self, cx: &mut Context<'_>, want: usize) -> Poll<usize> {
        loop {
            if self.credit > 0 {
                return Poll::Ready(self.credit.min(want));
            }
            if let Some(delay) = self.delay.as_mut() {
                ready!(delay.as_mut().poll(cx));
                self.delay = None;
            }
            match self.bucket.take(want) {
                Ok(n) => self.credit += n,
                Err(wait) => self.delay = Some(Box::pin(tokio::time::sleep(wait))),
            }
        }
    }

    fn spend(&mut self, n: usize) {
        self.credit = self.credit.saturating_sub(n);
    }
}

/// Stream whose reads and writes block until the bucket allows them.
/// Data is delayed, never dropped.
struct LimitedStream {
    inner: Stream,
    read: Option<Throttle>,
    write: Option<Throttle>,
}

impl AsyncRead for LimitedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let throttle = match me.read.as_mut() {
            Some(t) if buf.remaining() > 0 => t,
            _ => return Pin::new(&mut me.inner).poll_read(cx, buf),
        };

        let allowed = ready!(throttle.poll_credit(cx, buf.remaining()));
        let mut limited = ReadBuf::new(buf.initialize_unfilled_to(allowed));
        ready!(Pin::new(&mut me.inner).poll_read(cx, &mut limited))?;
        let n = limited.filled().len();

        buf.advance(n);
        throttle.spend(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for LimitedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        let throttle = match me.write.as_mut() {
            Some(t) if !buf.is_empty() => t,
            _ => return Pin::new(&mut me.inner).poll_write(cx, buf),
        };

        let allowed = ready!(throttle.poll_credit(cx, buf.len()));
        let n = ready!(Pin::new(&mut me.inner).poll_write(cx, &buf[..allowed]))?;
        throttle.spend(n);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
