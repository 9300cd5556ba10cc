//! Metrics collection and export for Tandem.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tandem_core::{EngineStats, JoinOutcome, RouteOutcome, TeardownOutcome};
use tandem_protocol::LeaveReason;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tandem_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tandem_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "tandem_connections_rejected_total";
    pub const FRAMES_TOTAL: &str = "tandem_frames_total";
    pub const FRAMES_BYTES: &str = "tandem_frames_bytes";
    pub const JOINS_TOTAL: &str = "tandem_joins_total";
    pub const LOST_MATCHES_TOTAL: &str = "tandem_lost_matches_total";
    pub const TEARDOWNS_TOTAL: &str = "tandem_teardowns_total";
    pub const ROUTED_TOTAL: &str = "tandem_routed_total";
    pub const WAITING: &str = "tandem_waiting";
    pub const ACTIVE_PAIRS: &str = "tandem_active_pairs";
    pub const FEEDBACK_TOTAL: &str = "tandem_feedback_total";
    pub const LATENCY_SECONDS: &str = "tandem_latency_seconds";
    pub const ERRORS_TOTAL: &str = "tandem_errors_total";
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
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Upgrades refused because the connection limit was reached"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(names::JOINS_TOTAL, "Join requests by outcome");
    metrics::describe_counter!(
        names::LOST_MATCHES_TOTAL,
        "Unreachable waiting entries discarded during matching"
    );
    metrics::describe_counter!(names::TEARDOWNS_TOTAL, "Teardowns by outcome and reason");
    metrics::describe_counter!(names::ROUTED_TOTAL, "Relayed events by outcome");
    metrics::describe_gauge!(names::WAITING, "Connections waiting for a partner");
    metrics::describe_gauge!(names::ACTIVE_PAIRS, "Chats in progress");
    metrics::describe_counter!(names::FEEDBACK_TOTAL, "Feedback submissions accepted");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

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

/// Record an upgrade refused at the connection limit.
pub fn record_rejected_connection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record inbound frame latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record a successful join.
pub fn record_join(outcome: &JoinOutcome) {
    let label = match outcome {
        JoinOutcome::Paired { .. } => "paired",
        JoinOutcome::Waiting { .. } => "waiting",
    };
    counter!(names::JOINS_TOTAL, "outcome" => label).increment(1);
}

/// Record a teardown.
pub fn record_teardown(outcome: &TeardownOutcome, reason: LeaveReason) {
    let label = match outcome {
        TeardownOutcome::Unpaired { .. } => "unpaired",
        TeardownOutcome::Dequeued => "dequeued",
        TeardownOutcome::Untracked => return,
    };
    counter!(names::TEARDOWNS_TOTAL, "outcome" => label, "reason" => reason.as_str()).increment(1);
}

/// Record a relayed event.
pub fn record_route(outcome: &RouteOutcome) {
    counter!(names::ROUTED_TOTAL, "outcome" => outcome.as_str()).increment(1);
}

/// Update engine gauges and the lost match counter.
pub fn set_engine_stats(stats: &EngineStats) {
    gauge!(names::WAITING).set(stats.waiting as f64);
    gauge!(names::ACTIVE_PAIRS).set(stats.active_pairs as f64);
    counter!(names::LOST_MATCHES_TOTAL).absolute(stats.lost_matches);
}

/// Record an accepted feedback submission.
pub fn record_feedback() {
    counter!(names::FEEDBACK_TOTAL).increment(1);
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

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::ConnectionId;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; recording is a no-op
        let _guard = ConnectionMetricsGuard::new();
    }

    #[test]
    fn test_recording_without_recorder() {
        record_join(&JoinOutcome::Paired {
            partner: ConnectionId::from_u128(2),
            purged: 2,
        });
        record_teardown(&TeardownOutcome::Untracked, LeaveReason::Ended);
        record_route(&RouteOutcome::PartnerUnreachable {
            partner: ConnectionId::from_u128(1),
        });
        set_engine_stats(&EngineStats::default());
    }
}
