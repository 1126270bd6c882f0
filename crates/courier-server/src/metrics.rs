//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use courier_core::{DeliveryReport, HubStats};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "courier_connections_rejected_total";
    pub const FRAMES_TOTAL: &str = "courier_frames_total";
    pub const FRAMES_BYTES: &str = "courier_frames_bytes";
    pub const DELIVERIES_TOTAL: &str = "courier_deliveries_total";
    pub const TOPICS_ACTIVE: &str = "courier_topics_active";
    pub const USERS_ONLINE: &str = "courier_users_online";
    pub const LATENCY_SECONDS: &str = "courier_frame_latency_seconds";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Register metric descriptions.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Upgrades refused because the connection limit was reached"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Messages written to outbound queues, by outcome"
    );
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of topic entries");
    metrics::describe_gauge!(names::USERS_ONLINE, "Distinct users with a live connection");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus exporter.
///
/// # Errors
///
/// Returns an error if the listener cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an upgrade refused at the connection limit.
pub fn record_rejected_connection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record the outcome of a fan-out.
pub fn record_delivery(report: DeliveryReport) {
    if report.delivered > 0 {
        counter!(names::DELIVERIES_TOTAL, "outcome" => "delivered")
            .increment(report.delivered as u64);
    }
    if report.failed > 0 {
        counter!(names::DELIVERIES_TOTAL, "outcome" => "failed").increment(report.failed as u64);
    }
}

/// Record frame processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update gauges from hub statistics.
pub fn record_hub_stats(stats: HubStats) {
    gauge!(names::TOPICS_ACTIVE).set(stats.topics as f64);
    gauge!(names::USERS_ONLINE).set(stats.users as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder is installed in tests; every call must be a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_frame(12, "inbound");
        record_delivery(DeliveryReport {
            delivered: 2,
            failed: 1,
        });
        record_error("websocket");
    }
}
