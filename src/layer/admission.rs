use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::app::metrics::SERVICE_ERRORS_TOTAL;
use crate::common::{Address, Conn, Result};
use crate::matcher::AddressMatcher;
use crate::transport::Listener;

/// Decides whether a client may connect at all.
pub trait Admission: Send + Sync {
    fn admit(&self, peer: &Address) -> bool;
}

/// Admission from an address list.
///
/// As a whitelist only matching peers are admitted, otherwise matching
/// peers are refused.
pub struct MatcherAdmission {
    matcher: AddressMatcher,
    whitelist: bool,
}

impl MatcherAdmission {
    pub fn new(matcher: AddressMatcher, whitelist: bool) -> Self {
        Self { matcher, whitelist }
    }
}

impl Admission for MatcherAdmission {
    fn admit(&self, peer: &Address) -> bool {
        self.matcher.matches(peer) == self.whitelist
    }
}

/// Closes refused connections and keeps accepting.
pub(super) struct AdmissionListener {
    inner: Box<dyn Listener>,
    admission: Arc<dyn Admission>,
    service: String,
}

impl AdmissionListener {
    pub fn new(inner: Box<dyn Listener>, admission: Arc<dyn Admission>, service: &str) -> Self {
        Self {
            inner,
            admission,
            service: service.to_string(),
        }
    }
}

#[async_trait]
impl Listener for AdmissionListener {
    async fn accept(&self) -> Result<Conn> {
        loop {
            let conn = self.inner.accept().await?;
            if self.admission.admit(&conn.peer) {
                return Ok(conn);
            }
            SERVICE_ERRORS_TOTAL.with_label_values(&[&self.service]).inc();
            debug!(service = %self.service, remote = %conn.peer, "admission: connection denied");
        }
    }

    fn local_addr(&self) -> Result<Address> {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> Address {
        Address::Socket(s.parse().unwrap())
    }

    #[test]
    fn test_blacklist() {
        let a = MatcherAdmission::new(AddressMatcher::new(&["10.0.0.0/8"]), false);
        assert!(!a.admit(&peer("10.1.2.3:1")));
        assert!(a.admit(&peer("192.168.0.1:1")));
    }

    #[test]
    fn test_whitelist() {
        let a = MatcherAdmission::new(AddressMatcher::new(&["10.0.0.0/8"]), true);
        assert!(a.admit(&peer("10.1.2.3:1")));
        assert!(!a.admit(&peer("192.168.0.1:1")));
    }
}
