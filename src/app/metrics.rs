//! Prometheus-based metrics module
//!
//! All metrics live in one registry exposed via the /metrics endpoint.
//! Registration failures are ignored: instrumentation never fails I/O.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Service Metrics ===

    /// Connections accepted per service
    pub static ref SERVICE_CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("relaykit_service_connections_total", "Total connections per service"),
        &["service"]
    ).unwrap();

    /// Open connections per service
    pub static ref SERVICE_CONNECTIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("relaykit_service_connections_active", "Active connections per service"),
        &["service"]
    ).unwrap();

    /// Bytes read from clients per service
    pub static ref SERVICE_INPUT_BYTES: IntCounterVec = IntCounterVec::new(
        Opts::new("relaykit_service_input_bytes_total", "Bytes received from clients per service"),
        &["service"]
    ).unwrap();

    /// Bytes written to clients per service
    pub static ref SERVICE_OUTPUT_BYTES: IntCounterVec = IntCounterVec::new(
        Opts::new("relaykit_service_output_bytes_total", "Bytes sent to clients per service"),
        &["service"]
    ).unwrap();

    /// Per-connection errors per service (rejections, bad headers)
    pub static ref SERVICE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("relaykit_service_errors_total", "Connection errors per service"),
        &["service"]
    ).unwrap();

    // === Listener Metrics ===

    /// Mux streams closed because the accept queue was full
    pub static ref MUX_STREAMS_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("relaykit_mux_streams_dropped_total", "Mux streams dropped by a full accept queue"),
        &["service"]
    ).unwrap();

    /// UDP datagrams dropped by a bypass rule
    pub static ref UDP_BYPASSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("relaykit_udp_bypassed_total", "UDP datagrams dropped by bypass rules"),
        &["direction"]
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(SERVICE_CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(SERVICE_CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(SERVICE_INPUT_BYTES.clone())).ok();
    REGISTRY.register(Box::new(SERVICE_OUTPUT_BYTES.clone())).ok();
    REGISTRY.register(Box::new(SERVICE_ERRORS_TOTAL.clone())).ok();

    REGISTRY.register(Box::new(MUX_STREAMS_DROPPED.clone())).ok();
    REGISTRY.register(Box::new(UDP_BYPASSED_TOTAL.clone())).ok();
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;
    const TB: u64 = 1024 * 1024 * 1024 * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_registration_is_idempotent() {
        init_metrics();
        init_metrics();
        SERVICE_CONNECTIONS_TOTAL.with_label_values(&["metrics-test"]).inc();
        let families = REGISTRY.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "relaykit_service_connections_total"));
    }
}
