//! Unix domain socket listener

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::common::{Address, Conn, Metadata, Result};
use crate::error::Error;

use super::{Listener, ListenerOptions};

/// Raw unix socket listener; the socket file is removed on close.
struct UnixBaseListener {
    listener: Mutex<Option<Arc<tokio::net::UnixListener>>>,
    path: String,
    closed: CancellationToken,
}

#[async_trait]
impl Listener for UnixBaseListener {
    async fn accept(&self) -> Result<Conn> {
        let listener = self.listener.lock().clone().ok_or(Error::Closed)?;

        let (stream, peer) = tokio::select! {
            _ = self.closed.cancelled() => return Err(Error::Closed),
            r = listener.accept() => r?,
        };

        let peer = peer
            .as_pathname()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Conn::new(
            Box::new(stream),
            Address::Unix(peer),
            Address::Unix(self.path.clone()),
        ))
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(Address::Unix(self.path.clone()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        if self.listener.lock().take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
        Ok(())
    }
}

/// The `unix` listener.
///
/// Proxy-protocol headers never apply to local sockets, every other
/// decorator does.
pub struct UnixListener;

impl UnixListener {
    pub async fn listen(opts: ListenerOptions, _md: Metadata) -> Result<Box<dyn Listener>> {
        let listener = tokio::net::UnixListener::bind(&opts.addr)?;
        let base = UnixBaseListener {
            listener: Mutex::new(Some(Arc::new(listener))),
            path: opts.addr.clone(),
            closed: CancellationToken::new(),
        };

        Ok(opts
            .pipeline
            .without_proxy_protocol()
            .wrap_listener(Box::new(base)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn socket_path(name: &str) -> String {
        let path = std::env::temp_dir().join(format!("relaykit-{}-{}.sock", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_unix_listener_roundtrip() {
        let path = socket_path("roundtrip");
        let ln = UnixListener::listen(ListenerOptions::new("unix", path.clone()), Metadata::new())
            .await
            .unwrap();

        let client_path = path.clone();
        let client = tokio::spawn(async move {
            let mut s = tokio::net::UnixStream::connect(client_path).await.unwrap();
            s.write_all(b"hello").await.unwrap();
        });

        let mut conn = ln.accept().await.unwrap();
        let mut buf = [0u8; 5];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(conn.local, Address::Unix(path.clone()));
        client.await.unwrap();

        ln.close().await.unwrap();
        assert!(!std::path::Path::new(&path).exists());
        assert!(matches!(ln.accept().await, Err(Error::Closed)));
    }
}
