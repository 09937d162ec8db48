//! Redirect (transparent proxy) TCP listener
//!
//! Connections arrive here through an iptables `REDIRECT` or `TPROXY` rule.
//! The destination the client actually asked for is recovered per connection
//! and carried on [`Conn::original_dst`](crate::common::Conn).

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tracing::debug;

use crate::common::{Metadata, Result};

use super::tcp::{bind_addr, SocketOptions, TcpBaseListener};
use super::{Listener, ListenerOptions};

/// The `red`/`redir`/`redirect` listener.
pub struct RedirectTcpListener;

impl RedirectTcpListener {
    pub async fn listen(opts: ListenerOptions, md: Metadata) -> Result<Box<dyn Listener>> {
        let addr = bind_addr(&opts.addr)?;
        let sock_opts = SocketOptions {
            mptcp: md.get_bool("mptcp"),
            transparent: md.get_bool("tproxy"),
        };

        let base = TcpBaseListener::bind(opts.listen_config.as_ref(), addr, &sock_opts)?
            .with_original_dst(sock_opts.transparent);
        debug!(
            service = %opts.service,
            mptcp = sock_opts.mptcp,
            tproxy = sock_opts.transparent,
            "redirect listener on {}", addr
        );

        Ok(opts.pipeline.wrap_listener(Box::new(base)))
    }
}

/// Destination of a redirected connection.
///
/// Under tproxy the socket keeps the original destination as its local
/// address; with NAT redirection the kernel reports it via `SO_ORIGINAL_DST`.
pub(super) fn original_dst(stream: &TcpStream, tproxy: bool) -> Option<SocketAddr> {
    if tproxy {
        return stream.local_addr().ok();
    }
    nat_original_dst(stream)
}

#[cfg(target_os = "linux")]
fn nat_original_dst(stream: &TcpStream) -> Option<SocketAddr> {
    let sock = socket2::SockRef::from(stream);
    let is_v6 = stream.local_addr().map(|a| a.is_ipv6()).unwrap_or(false);
    let addr = if is_v6 {
        sock.original_dst_ipv6()
    } else {
        sock.original_dst()
    };
    match addr {
        Ok(a) => a.as_socket(),
        Err(e) => {
            debug!("SO_ORIGINAL_DST: {}", e);
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn nat_original_dst(_stream: &TcpStream) -> Option<SocketAddr> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::common::Address;
    use crate::transport::tcp::tests::CapturingListenConfig;

    #[tokio::test]
    async fn test_redirect_requests_socket_options() {
        let lc = Arc::new(CapturingListenConfig::default());
        let opts = ListenerOptions::new("redir", "127.0.0.1:0").with_listen_config(lc.clone());
        RedirectTcpListener::listen(opts, Metadata::new().with("tproxy", true).with("mptcp", true))
            .await
            .unwrap();

        assert_eq!(
            lc.seen.lock()[0],
            SocketOptions { mptcp: true, transparent: true }
        );
    }

    #[tokio::test]
    async fn test_tproxy_destination_is_local_address() {
        let lc = Arc::new(CapturingListenConfig::default());
        let opts = ListenerOptions::new("redir", "127.0.0.1:0").with_listen_config(lc);
        let ln = RedirectTcpListener::listen(opts, Metadata::new().with("tproxy", true))
            .await
            .unwrap();
        let addr = ln.local_addr().unwrap().as_socket().unwrap();

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let conn = ln.accept().await.unwrap();
        assert_eq!(conn.original_dst, Some(Address::Socket(addr)));
    }
}
