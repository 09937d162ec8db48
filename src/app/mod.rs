//! Application Layer
//!
//! This module contains:
//! - Registry: listener and handler constructors by type name
//! - Runtime: configuration-driven service construction and accept loops
//! - StatsApi: HTTP API for runtime statistics with Prometheus metrics

pub mod metrics;
mod registry;
mod runtime;
pub mod stats_api;

pub use registry::{HandlerFactory, ListenerFactory, ListenerFuture, Registry};
pub use runtime::{Runtime, Service};
pub use stats_api::{ServiceStats, StatsCollector};
