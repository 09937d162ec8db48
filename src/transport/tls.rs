//! TLS listener implementation
//!
//! The decorator pipeline runs on the raw TCP listener, TLS is terminated on
//! top of it. The handshake is driven lazily by the first read or write so a
//! slow client never holds up `accept`.

use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, TlsAcceptor};
use tracing::debug;

use crate::common::{Address, Conn, Metadata, Result, Stream};
use crate::error::Error;

use super::tcp::{bind_addr, SocketOptions, TcpBaseListener};
use super::{Listener, ListenerOptions};

/// Build a server config from PEM certificate chain and private key files.
pub fn load_server_config(cert_file: &str, key_file: &str) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("TLS protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("Invalid certificate/key: {}", e)))?;

    Ok(Arc::new(config))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("Failed to open certificate file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!("No certificate found in {}", path)));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("Failed to open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| Error::Config("No valid private key found in file".into()))
}

/// The `tls` listener.
pub struct TlsListener {
    inner: Box<dyn Listener>,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    pub async fn listen(opts: ListenerOptions, md: Metadata) -> Result<Box<dyn Listener>> {
        let tls = opts
            .tls
            .clone()
            .ok_or_else(|| Error::Config("tls listener requires certFile and keyFile".into()))?;

        let addr = bind_addr(&opts.addr)?;
        let sock_opts = SocketOptions {
            mptcp: md.get_bool("mptcp"),
            transparent: false,
        };
        let base = TcpBaseListener::bind(opts.listen_config.as_ref(), addr, &sock_opts)?;
        if sock_opts.mptcp {
            debug!(service = %opts.service, "mptcp enabled");
        }

        Ok(Box::new(Self {
            inner: opts.pipeline.wrap_listener(Box::new(base)),
            acceptor: TlsAcceptor::from(tls),
        }))
    }
}

#[async_trait]
impl Listener for TlsListener {
    async fn accept(&self) -> Result<Conn> {
        let conn = self.inner.accept().await?;
        let acceptor = self.acceptor.clone();
        Ok(conn.map_stream(|s| Box::new(LazyTls::Handshaking(Box::pin(acceptor.accept(s))))))
    }

    fn local_addr(&self) -> Result<Address> {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

enum LazyTls {
    Handshaking(Pin<Box<Accept<Stream>>>),
    Ready(Box<TlsStream<Stream>>),
    Failed,
}

impl LazyTls {
    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<&mut TlsStream<Stream>>> {
        if let LazyTls::Handshaking(accept) = self {
            match accept.as_mut().poll(cx) {
                Poll::Ready(Ok(stream)) => *self = LazyTls::Ready(Box::new(stream)),
                Poll::Ready(Err(e)) => {
                    *self = LazyTls::Failed;
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        match self {
            LazyTls::Ready(stream) => Poll::Ready(Ok(&mut **stream)),
            _ => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "tls handshake failed",
            ))),
        }
    }
}

impl AsyncRead for LazyTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut().poll_handshake(cx) {
            Poll::Ready(Ok(stream)) => Pin::new(stream).poll_read(cx, buf),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for LazyTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut().poll_handshake(cx) {
            Poll::Ready(Ok(stream)) => Pin::new(stream).poll_write(cx, buf),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut().poll_handshake(cx) {
            Poll::Ready(Ok(stream)) => Pin::new(stream).poll_flush(cx),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut().poll_handshake(cx) {
            Poll::Ready(Ok(stream)) => Pin::new(stream).poll_shutdown(cx),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}
