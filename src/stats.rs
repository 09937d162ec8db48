//! Per-client usage statistics
//!
//! Counters are plain atomics so that every connection task can update
//! them without locking. A [`StatsSet`] maps client identities to their
//! counters; the anonymous bucket has the empty name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::common::ClientId;

/// Counter kinds tracked per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    TotalConns,
    CurrentConns,
    InputBytes,
    OutputBytes,
    TotalErrs,
}

/// Counter set of one client.
#[derive(Debug, Default)]
pub struct Stats {
    total_conns: AtomicI64,
    current_conns: AtomicI64,
    input_bytes: AtomicI64,
    output_bytes: AtomicI64,
    total_errs: AtomicI64,
}

/// Point-in-time copy of a [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub total_conns: i64,
    pub current_conns: i64,
    pub input_bytes: i64,
    pub output_bytes: i64,
    pub total_errs: i64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: Kind) -> &AtomicI64 {
        match kind {
            Kind::TotalConns => &self.total_conns,
            Kind::CurrentConns => &self.current_conns,
            Kind::InputBytes => &self.input_bytes,
            Kind::OutputBytes => &self.output_bytes,
            Kind::TotalErrs => &self.total_errs,
        }
    }

    pub fn add(&self, kind: Kind, n: i64) {
        self.counter(kind).fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, kind: Kind) -> i64 {
        self.counter(kind).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            total_conns: self.get(Kind::TotalConns),
            current_conns: self.get(Kind::CurrentConns),
            input_bytes: self.get(Kind::InputBytes),
            output_bytes: self.get(Kind::OutputBytes),
            total_errs: self.get(Kind::TotalErrs),
        }
    }
}

/// Counters of every client seen by a service.
#[derive(Debug, Default)]
pub struct StatsSet {
    clients: RwLock<HashMap<String, Arc<Stats>>>,
}

impl StatsSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `client`, created on first use.
    pub fn stats(&self, client: Option<&ClientId>) -> Arc<Stats> {
        let key = client.map(ClientId::as_str).unwrap_or_default();
        if let Some(s) = self.clients.read().get(key) {
            return s.clone();
        }
        self.clients
            .write()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Snapshot of every client, keyed by client name.
    pub fn snapshot(&self) -> HashMap<String, Snapshot> {
        self.clients
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let s = Stats::new();
        s.add(Kind::TotalConns, 1);
        s.add(Kind::CurrentConns, 1);
        s.add(Kind::CurrentConns, -1);
        s.add(Kind::InputBytes, 10);

        assert_eq!(
            s.snapshot(),
            Snapshot {
                total_conns: 1,
                current_conns: 0,
                input_bytes: 10,
                ..Snapshot::default()
            }
        );
    }

    #[test]
    fn test_anonymous_bucket() {
        let set = StatsSet::new();
        set.stats(None).add(Kind::TotalConns, 1);
        set.stats(Some(&ClientId::new(""))).add(Kind::TotalConns, 1);
        set.stats(Some(&ClientId::new("alice"))).add(Kind::TotalConns, 1);

        let snap = set.snapshot();
        assert_eq!(snap[""].total_conns, 2);
        assert_eq!(snap["alice"].total_conns, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let set = Arc::new(StatsSet::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = set.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        set.stats(None).add(Kind::InputBytes, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(set.stats(None).get(Kind::InputBytes), 8000);
    }
}
