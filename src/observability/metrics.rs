//! Metrics collection and exposition.
//!
//! # Metrics
//! - `bmcweb_active_connections` (gauge): live connection count
//! - `bmcweb_requests_total` (counter): responses written, by status
//! - `bmcweb_connections_rejected_total` (counter): refused at the ceiling
//! - `bmcweb_connection_timeouts_total` (counter): closed by the deadline
//! - `bmcweb_certificate_reloads_total` (counter): reload attempts, by result
//!
//! Recording goes through the `metrics` facade and is a no-op until an
//! exporter is installed.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    describe_gauge!("bmcweb_active_connections", "Number of open client connections");
    describe_counter!("bmcweb_requests_total", "HTTP/1.1 responses written");
    describe_counter!(
        "bmcweb_connections_rejected_total",
        "Connections dropped at the connection ceiling"
    );
    describe_counter!(
        "bmcweb_connection_timeouts_total",
        "Connections closed because an operation missed its deadline"
    );
    describe_counter!(
        "bmcweb_certificate_reloads_total",
        "TLS certificate reload attempts"
    );

    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_active_connections(count: usize) {
    gauge!("bmcweb_active_connections").set(count as f64);
}

pub fn record_request(status: u16) {
    counter!("bmcweb_requests_total", "status" => status.to_string()).increment(1);
}

pub fn record_connection_rejected() {
    counter!("bmcweb_connections_rejected_total").increment(1);
}

pub fn record_timeout() {
    counter!("bmcweb_connection_timeouts_total").increment(1);
}

pub fn record_certificate_reload(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!("bmcweb_certificate_reloads_total", "result" => result).increment(1);
}
