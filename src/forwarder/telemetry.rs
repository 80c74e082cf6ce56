use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::forwarder::proxy::Direction;

pub const TUNNELS_TOTAL: &str = "forwarder_tunnels_total";
pub const ACTIVE_TUNNELS: &str = "forwarder_active_tunnels";
pub const TUNNEL_FAILURES_TOTAL: &str = "forwarder_tunnel_failures_total";
pub const BYTES_TOTAL: &str = "forwarder_bytes_total";

/// Installs the Prometheus recorder and serves the exposition endpoint on
/// `addr`. Must run inside the Tokio runtime; call once per process.
pub fn init_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("metrics: install Prometheus exporter on {addr}"))
}

/// Counts a tunnel task for as long as it is alive.
pub struct ActiveTunnelGuard;

impl ActiveTunnelGuard {
    pub fn new() -> Self {
        metrics::counter!(TUNNELS_TOTAL).increment(1);
        metrics::gauge!(ACTIVE_TUNNELS).increment(1.0);
        Self
    }
}

impl Drop for ActiveTunnelGuard {
    fn drop(&mut self) {
        metrics::gauge!(ACTIVE_TUNNELS).decrement(1.0);
    }
}

pub fn record_failure(stage: &'static str) {
    metrics::counter!(TUNNEL_FAILURES_TOTAL, "stage" => stage).increment(1);
}

pub fn record_bytes(direction: Direction, n: u64) {
    metrics::counter!(BYTES_TOTAL, "direction" => direction.as_str()).increment(n);
}
