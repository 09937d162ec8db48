//! Traffic and connection limiters
//!
//! Rules are scoped either to the whole service (`$`) or to client
//! addresses (an IP or CIDR, one budget per client IP).

mod conn;

pub use conn::{ConnLimitRule, ConnLimiter, ConnPermit, SemaphoreConnLimiter};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::common::Address;
use crate::error::{Error, Result};

/// Rule scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    /// `$`: one budget for the whole service
    Service,
    /// One budget per client IP inside the network
    Client(IpNet),
}

impl Scope {
    pub(crate) fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "$" {
            return Ok(Scope::Service);
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Scope::Client(IpNet::from(ip)));
        }
        s.parse::<IpNet>()
            .map(Scope::Client)
            .map_err(|_| Error::Config(format!("invalid limiter scope: {}", s)))
    }
}

/// Token bucket counting bytes; the burst equals one second of rate.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// `rate` is in bytes per second and must be positive.
    pub fn new(rate: usize) -> Self {
        let rate = rate.max(1) as f64;
        Self {
            rate,
            burst: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> usize {
        self.rate as usize
    }

    /// Take up to `want` tokens.
    ///
    /// Returns how many were granted, or how long until at least one is
    /// available.
    pub fn take(&self, want: usize) -> std::result::Result<usize, Duration> {
        let mut st = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(st.last).as_secs_f64();
        st.tokens = (st.tokens + elapsed * self.rate).min(self.burst);
        st.last = now;

        if st.tokens >= 1.0 {
            let n = (want as f64).min(st.tokens.floor());
            st.tokens -= n;
            Ok(n as usize)
        } else {
            Err(Duration::from_secs_f64((1.0 - st.tokens) / self.rate))
        }
    }

    /// Wait until some tokens are available and take up to `want` of them.
    pub async fn wait(&self, want: usize) -> usize {
        loop {
            match self.take(want) {
                Ok(n) => return n,
                Err(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

/// Source of token buckets for a connection.
pub trait TrafficLimiter: Send + Sync {
    /// Bucket throttling bytes read from `peer`
    fn inbound(&self, peer: &Address) -> Option<Arc<TokenBucket>>;

    /// Bucket throttling bytes written to `peer`
    fn outbound(&self, peer: &Address) -> Option<Arc<TokenBucket>>;
}

/// A traffic limiter rule. Rates are bytes per second, 0 for unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    #[serde(rename = "match")]
    pub scope: String,
    #[serde(default)]
    pub input: usize,
    #[serde(default)]
    pub output: usize,
}

#[derive(Debug, Clone, Default)]
struct BucketPair {
    input: Option<Arc<TokenBucket>>,
    output: Option<Arc<TokenBucket>>,
}

impl BucketPair {
    fn new(input: usize, output: usize) -> Self {
        Self {
            input: (input > 0).then(|| Arc::new(TokenBucket::new(input))),
            output: (output > 0).then(|| Arc::new(TokenBucket::new(output))),
        }
    }

    fn in_use(&self) -> bool {
        let used = |b: &Option<Arc<TokenBucket>>| b.as_ref().is_some_and(|b| Arc::strong_count(b) > 1);
        used(&self.input) || used(&self.output)
    }
}

/// Rule-based [`TrafficLimiter`].
///
/// The first client rule matching the peer IP wins; peers matching no
/// client rule share the service-wide budget, if any.
pub struct RateLimiter {
    service: BucketPair,
    rules: Vec<(IpNet, usize, usize)>,
    clients: Mutex<HashMap<IpAddr, BucketPair>>,
}

impl RateLimiter {
    pub fn new(rules: &[LimitRule]) -> Result<Self> {
        let mut service = BucketPair::default();
        let mut client_rules = Vec::new();
        for rule in rules {
            match Scope::parse(&rule.scope)? {
                Scope::Service => service = BucketPair::new(rule.input, rule.output),
                Scope::Client(net) => client_rules.push((net, rule.input, rule.output)),
            }
        }
        Ok(Self {
            service,
            rules: client_rules,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn buckets(&self, peer: &Address) -> BucketPair {
        let rule = peer
            .ip()
            .and_then(|ip| self.rules.iter().find(|(net, _, _)| net.contains(&ip)).map(|r| (ip, r)));

        match rule {
            Some((ip, &(_, input, output))) => {
                let mut clients = self.clients.lock();
                if let Some(pair) = clients.get(&ip) {
                    return pair.clone();
                }
                // Forget clients without live connections
                clients.retain(|_, pair| pair.in_use());
                let pair = BucketPair::new(input, output);
                clients.insert(ip, pair.clone());
                pair
            }
            None => self.service.clone(),
        }
    }
}

impl TrafficLimiter for RateLimiter {
    fn inbound(&self, peer: &Address) -> Option<Arc<TokenBucket>> {
        self.buckets(peer).input
    }

    fn outbound(&self, peer: &Address) -> Option<Arc<TokenBucket>> {
        self.buckets(peer).output
    }
}
