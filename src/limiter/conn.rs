use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::common::Address;
use crate::error::Result;

use super::Scope;

/// Caps the number of concurrent connections.
pub trait ConnLimiter: Send + Sync {
    /// Take a slot for a connection from `peer`, `None` when over the cap.
    fn acquire(&self, peer: &Address) -> Option<ConnPermit>;
}

/// Slots held by one connection; released on drop.
#[derive(Debug)]
pub struct ConnPermit {
    _permits: Vec<OwnedSemaphorePermit>,
}

/// A connection limiter rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnLimitRule {
    #[serde(rename = "match")]
    pub scope: String,
    pub limit: usize,
}

/// Semaphore-backed [`ConnLimiter`].
///
/// The service-wide cap and the first matching per-client cap both apply.
pub struct SemaphoreConnLimiter {
    service: Option<Arc<Semaphore>>,
    rules: Vec<(IpNet, usize)>,
    clients: Mutex<HashMap<IpAddr, Arc<Semaphore>>>,
}

impl SemaphoreConnLimiter {
    pub fn new(rules: &[ConnLimitRule]) -> Result<Self> {
        let mut service = None;
        let mut client_rules = Vec::new();
        for rule in rules {
            match Scope::parse(&rule.scope)? {
                Scope::Service => service = Some(Arc::new(Semaphore::new(rule.limit))),
                Scope::Client(net) => client_rules.push((net, rule.limit)),
            }
        }
        Ok(Self {
            service,
            rules: client_rules,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn client_semaphore(&self, ip: IpAddr) -> Option<Arc<Semaphore>> {
        let &(_, limit) = self.rules.iter().find(|(net, _)| net.contains(&ip))?;
        let mut clients = self.clients.lock();
        // Owned permits hold a reference, so a count of one means idle
        clients.retain(|_, sem| Arc::strong_count(sem) > 1);
        let sem = clients
            .entry(ip)
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone();
        Some(sem)
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }
}

impl ConnLimiter for SemaphoreConnLimiter {
    fn acquire(&self, peer: &Address) -> Option<ConnPermit> {
        let mut permits = Vec::with_capacity(2);
        if let Some(sem) = &self.service {
            permits.push(sem.clone().try_acquire_owned().ok()?);
        }
        if let Some(sem) = peer.ip().and_then(|ip| self.client_semaphore(ip)) {
            permits.push(sem.try_acquire_owned().ok()?);
        }
        Some(ConnPermit { _permits: permits })
    }
}
