//! Metrics collection and export for Hark.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use hark_core::Outcome;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "hark_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "hark_connections_active";
    pub const EVENTS_TOTAL: &str = "hark_events_total";
    pub const EVENTS_BYTES: &str = "hark_events_bytes";
    pub const OUTCOMES_TOTAL: &str = "hark_outcomes_total";
    pub const ONLINE_USERS: &str = "hark_online_users";
    pub const LATENCY_SECONDS: &str = "hark_latency_seconds";
    pub const ERRORS_TOTAL: &str = "hark_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of events by name and direction");
    metrics::describe_counter!(names::EVENTS_BYTES, "Total bytes of encoded events");
    metrics::describe_counter!(
        names::OUTCOMES_TOTAL,
        "Handled inbound events by outcome"
    );
    metrics::describe_gauge!(names::ONLINE_USERS, "Current number of online users");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an event crossing the socket.
pub fn record_event(event: &'static str, bytes: usize, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "direction" => direction, "event" => event).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record what handling an inbound event amounted to.
pub fn record_outcome(outcome: &Outcome) {
    counter!(names::OUTCOMES_TOTAL, "outcome" => outcome.as_str()).increment(1);
}

/// Record event handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update the online user count.
pub fn set_online_users(count: usize) {
    gauge!(names::ONLINE_USERS).set(count as f64);
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
        record_connection();
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
        record_disconnection();
    }
}
