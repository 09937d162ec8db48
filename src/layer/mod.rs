//! Decorator pipeline
//!
//! Cross-cutting controls wrapped around a raw listener (or, for datagram
//! listeners, around every accepted connection). The order is fixed:
//!
//! ```text
//! raw listener
//!   └► proxy protocol   (rewrites the peer address)
//!       └► metrics
//!           └► stats
//!               └► admission
//!                   └► traffic limiter
//!                       └► conn limiter ──► accept()
//! ```
//!
//! Every later layer sees the connection after the earlier ones approved
//! or rewrote it, so limits and admission apply to the address declared
//! in the proxy-protocol header.

mod admission;
mod conn_limit;
mod metrics;
mod proxy_protocol;
mod stats;
mod traffic;

pub use admission::{Admission, MatcherAdmission};
pub use proxy_protocol::{ProxyPolicy, ProxyProtocolConfig};
pub use stats::{StatsPacketConn, StatsStream};

use std::sync::Arc;

use crate::common::{Conn, Result};
use crate::error::Error;
use crate::limiter::{ConnLimiter, TrafficLimiter};
use crate::stats::Stats;
use crate::transport::Listener;

/// One decorator.
#[derive(Clone)]
pub enum Layer {
    ProxyProtocol(ProxyProtocolConfig),
    Metrics,
    Stats(Arc<Stats>),
    Admission(Arc<dyn Admission>),
    TrafficLimit(Arc<dyn TrafficLimiter>),
    ConnLimit(Arc<dyn ConnLimiter>),
}

impl Layer {
    /// Position in the canonical order
    fn rank(&self) -> u8 {
        match self {
            Layer::ProxyProtocol(_) => 0,
            Layer::Metrics => 1,
            Layer::Stats(_) => 2,
            Layer::Admission(_) => 3,
            Layer::TrafficLimit(_) => 4,
            Layer::ConnLimit(_) => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Layer::ProxyProtocol(_) => "proxy_protocol",
            Layer::Metrics => "metrics",
            Layer::Stats(_) => "stats",
            Layer::Admission(_) => "admission",
            Layer::TrafficLimit(_) => "traffic_limiter",
            Layer::ConnLimit(_) => "conn_limiter",
        }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered decorators of one service.
#[derive(Clone, Default, Debug)]
pub struct Pipeline {
    service: String,
    layers: Vec<Layer>,
}

impl Pipeline {
    /// Create a new builder.
    pub fn builder(service: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(service)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Layer names, innermost first.
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(Layer::name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The same pipeline minus proxy-protocol unwrapping.
    pub fn without_proxy_protocol(&self) -> Pipeline {
        Pipeline {
            service: self.service.clone(),
            layers: self
                .layers
                .iter()
                .filter(|l| !matches!(l, Layer::ProxyProtocol(_)))
                .cloned()
                .collect(),
        }
    }

    /// Wrap a listener with every layer, in order.
    pub fn wrap_listener(&self, listener: Box<dyn Listener>) -> Box<dyn Listener> {
        let service = self.service.as_str();
        self.layers.iter().fold(listener, |inner, layer| match layer {
            Layer::ProxyProtocol(cfg) => {
                Box::new(proxy_protocol::ProxyProtocolListener::new(inner, *cfg, service))
            }
            Layer::Metrics => Box::new(metrics::MetricsListener::new(inner, service)),
            Layer::Stats(s) => Box::new(stats::StatsListener::new(inner, s.clone())),
            Layer::Admission(a) => Box::new(admission::AdmissionListener::new(inner, a.clone(), service)),
            Layer::TrafficLimit(l) => Box::new(traffic::TrafficListener::new(inner, l.clone())),
            Layer::ConnLimit(l) => Box::new(conn_limit::ConnLimitListener::new(inner, l.clone(), service)),
        })
    }

    /// Decorate one connection of a datagram listener.
    ///
    /// Proxy-protocol and connection limiting do not apply here. Returns
    /// [`Error::Rejected`] when admission denies the peer.
    pub fn wrap_conn(&self, conn: Conn) -> Result<Conn> {
        let service = self.service.as_str();
        self.layers.iter().try_fold(conn, |conn, layer| match layer {
            Layer::ProxyProtocol(_) | Layer::ConnLimit(_) => Ok(conn),
            Layer::Metrics => Ok(metrics::instrument(conn, service)),
            Layer::Stats(s) => Ok(stats::instrument(conn, s.clone())),
            Layer::Admission(a) => {
                if a.admit(&conn.peer) {
                    Ok(conn)
                } else {
                    Err(Error::Rejected(format!("admission: {} is denied", conn.peer)))
                }
            }
            Layer::TrafficLimit(l) => Ok(traffic::limit(conn, l.as_ref())),
        })
    }
}

/// Builder for [`Pipeline`].
///
/// Layers may be added in any order; `build` sorts them into the canonical
/// order and keeps the last one added of each kind.
pub struct PipelineBuilder {
    service: String,
    layers: Vec<Layer>,
}

impl PipelineBuilder {
    fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            layers: Vec::new(),
        }
    }

    /// Add a layer.
    pub fn layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Add proxy-protocol unwrapping unless the policy is `off`.
    pub fn proxy_protocol(self, cfg: ProxyProtocolConfig) -> Self {
        if cfg.policy == ProxyPolicy::Off {
            return self;
        }
        self.layer(Layer::ProxyProtocol(cfg))
    }

    pub fn metrics(self) -> Self {
        self.layer(Layer::Metrics)
    }

    pub fn stats(self, stats: Arc<Stats>) -> Self {
        self.layer(Layer::Stats(stats))
    }

    pub fn admission(self, admission: Arc<dyn Admission>) -> Self {
        self.layer(Layer::Admission(admission))
    }

    pub fn traffic_limiter(self, limiter: Arc<dyn TrafficLimiter>) -> Self {
        self.layer(Layer::TrafficLimit(limiter))
    }

    pub fn conn_limiter(self, limiter: Arc<dyn ConnLimiter>) -> Self {
        self.layer(Layer::ConnLimit(limiter))
    }

    /// Build the pipeline.
    pub fn build(self) -> Pipeline {
        let mut layers: Vec<Layer> = Vec::with_capacity(self.layers.len());
        for layer in self.layers {
            match layers.iter().position(|l| l.rank() == layer.rank()) {
                Some(i) => layers[i] = layer,
                None => layers.push(layer),
            }
        }
        layers.sort_by_key(Layer::rank);
        Pipeline {
            service: self.service,
            layers,
        }
    }
}
