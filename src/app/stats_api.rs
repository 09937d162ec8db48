//! Metrics and statistics HTTP endpoint
//!
//! - `/metrics`: Prometheus text exposition
//! - `/stats`: JSON snapshot of every service and its clients

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::metrics::REGISTRY;
use crate::stats::{Snapshot, Stats, StatsSet};

/// Counters of one service.
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    /// Connection-level counters fed by the listener pipeline
    pub service: Arc<Stats>,
    /// Per-client counters fed by the handler
    pub clients: Arc<StatsSet>,
}

/// Statistics of every configured service, keyed by service name.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    services: BTreeMap<String, ServiceStats>,
}

#[derive(Debug, Serialize)]
pub struct ServiceSnapshot {
    #[serde(flatten)]
    pub service: Snapshot,
    pub clients: HashMap<String, Snapshot>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `service`, created on first use.
    pub fn service(&mut self, service: &str) -> ServiceStats {
        self.services.entry(service.to_string()).or_default().clone()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ServiceSnapshot> {
        self.services
            .iter()
            .map(|(name, s)| {
                let snap = ServiceSnapshot {
                    service: s.service.snapshot(),
                    clients: s.clients.snapshot(),
                };
                (name.clone(), snap)
            })
            .collect()
    }
}

/// Prometheus metrics endpoint
async fn get_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn get_stats(State(collector): State<Arc<StatsCollector>>) -> impl IntoResponse {
    Json(collector.snapshot())
}

/// Build the API router
pub fn build_api_router(collector: Arc<StatsCollector>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/stats", get(get_stats))
        .with_state(collector)
}

/// Serve the API on an already bound listener until shutdown.
pub async fn serve_api(
    listener: tokio::net::TcpListener,
    collector: Arc<StatsCollector>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    axum::serve(listener, build_api_router(collector))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Metrics server shutting down");
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Metrics server error: {}", e);
        });
}

/// Start the metrics server
pub async fn start_api_server(
    addr: SocketAddr,
    collector: Arc<StatsCollector>,
    shutdown_rx: broadcast::Receiver<()>,
) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    info!("Metrics server listening on http://{}/metrics", addr);
    serve_api(listener, collector, shutdown_rx).await;
}
