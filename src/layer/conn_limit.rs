use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::app::metrics::SERVICE_ERRORS_TOTAL;
use crate::common::{Address, Conn, Result, Stream};
use crate::limiter::{ConnLimiter, ConnPermit};
use crate::transport::Listener;

/// Closes connections over the cap right away; they are never queued.
pub(super) struct ConnLimitListener {
    inner: Box<dyn Listener>,
    limiter: Arc<dyn ConnLimiter>,
    service: String,
}

impl ConnLimitListener {
    pub fn new(inner: Box<dyn Listener>, limiter: Arc<dyn ConnLimiter>, service: &str) -> Self {
        Self {
            inner,
            limiter,
            service: service.to_string(),
        }
    }
}

#[async_trait]
impl Listener for ConnLimitListener {
    async fn accept(&self) -> Result<Conn> {
        loop {
            let conn = self.inner.accept().await?;
            match self.limiter.acquire(&conn.peer) {
                Some(permit) => {
                    return Ok(conn.map_stream(|inner| Box::new(PermitStream { inner, _permit: permit })))
                }
                None => {
                    SERVICE_ERRORS_TOTAL.with_label_values(&[&self.service]).inc();
                    debug!(service = %self.service, remote = %conn.peer, "connection limit reached");
                }
            }
        }
    }

    fn local_addr(&self) -> Result<Address> {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Holds the limiter slot for as long as the connection lives.
struct PermitStream {
    inner: Stream,
    _permit: ConnPermit,
}

impl AsyncRead for PermitStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PermitStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
