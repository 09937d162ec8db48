use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use prometheus::{IntCounter, IntGauge};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::app::metrics::{
    SERVICE_CONNECTIONS_ACTIVE, SERVICE_CONNECTIONS_TOTAL, SERVICE_INPUT_BYTES, SERVICE_OUTPUT_BYTES,
};
use crate::common::{Address, Conn, Result, Stream};
use crate::transport::Listener;

/// Per-service metric handles, resolved once per listener.
#[derive(Clone)]
struct ServiceMetrics {
    total: IntCounter,
    active: IntGauge,
    input: IntCounter,
    output: IntCounter,
}

impl ServiceMetrics {
    fn new(service: &str) -> Self {
        Self {
            total: SERVICE_CONNECTIONS_TOTAL.with_label_values(&[service]),
            active: SERVICE_CONNECTIONS_ACTIVE.with_label_values(&[service]),
            input: SERVICE_INPUT_BYTES.with_label_values(&[service]),
            output: SERVICE_OUTPUT_BYTES.with_label_values(&[service]),
        }
    }

    fn wrap(&self, conn: Conn) -> Conn {
        self.total.inc();
        self.active.inc();
        let metrics = self.clone();
        conn.map_stream(|inner| Box::new(MetricsStream { inner, metrics }))
    }
}

/// Count `conn` and its traffic under `service`.
pub(super) fn instrument(conn: Conn, service: &str) -> Conn {
    ServiceMetrics::new(service).wrap(conn)
}

pub(super) struct MetricsListener {
    inner: Box<dyn Listener>,
    metrics: ServiceMetrics,
}

impl MetricsListener {
    pub fn new(inner: Box<dyn Listener>, service: &str) -> Self {
        Self {
            inner,
            metrics: ServiceMetrics::new(service),
        }
    }
}

#[async_trait]
impl Listener for MetricsListener {
    async fn accept(&self) -> Result<Conn> {
        let conn = self.inner.accept().await?;
        Ok(self.metrics.wrap(conn))
    }

    fn local_addr(&self) -> Result<Address> {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

struct MetricsStream {
    inner: Stream,
    metrics: ServiceMetrics,
}

impl AsyncRead for MetricsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let r = Pin::new(&mut self.inner).poll_read(cx, buf);
        let n = buf.filled().len() - before;
        if n > 0 {
            self.metrics.input.inc_by(n as u64);
        }
        r
    }
}

impl AsyncWrite for MetricsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let r = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &r {
            self.metrics.output.inc_by(*n as u64);
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

impl Drop for MetricsStream {
    fn drop(&mut self) {
        self.metrics.active.dec();
    }
}
