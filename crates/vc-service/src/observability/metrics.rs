//! Metric definitions for the Voice Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `vc_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! Every label takes its value from a small fixed set.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used by
/// `/metrics`.
///
/// Must be called before any metric is recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling handlers include engine round-trips
        .set_buckets_for_metric(
            Matcher::Prefix("vc_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        // Reconnects land anywhere inside the grace window
        .set_buckets_for_metric(
            Matcher::Prefix("vc_reconnect".to_string()),
            &[0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 45.0, 60.0],
        )
        .map_err(|e| format!("Failed to set reconnect latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("vc_backend".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set backend validation buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `vc_connections_active`
pub fn set_connections_active(count: u64) {
    // u64 to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("vc_connections_active").set(count as f64);
}

/// Metric: `vc_channels_active`
pub fn set_channels_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("vc_channels_active").set(count as f64);
}

/// Metric: `vc_staged_participants`
pub fn set_staged_participants(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("vc_staged_participants").set(count as f64);
}

// ============================================================================
// Session lifecycle
// ============================================================================

/// Record a participant entering Active.
///
/// Metric: `vc_joins_total`
/// Labels: `kind` (fresh, restore)
pub fn record_join(kind: &str) {
    counter!("vc_joins_total", "kind" => kind.to_string()).increment(1);
}

/// Record a staged disconnect.
///
/// Metric: `vc_staged_total`
/// Labels: `reason` (close, heartbeat-timeout)
pub fn record_staged(reason: &str) {
    counter!("vc_staged_total", "reason" => reason.to_string()).increment(1);
}

/// Metric: `vc_finalized_total`
pub fn record_finalized() {
    counter!("vc_finalized_total").increment(1);
}

/// Time between staging and restore.
///
/// Metric: `vc_reconnect_latency_seconds`
pub fn record_reconnect_latency(duration: Duration) {
    histogram!("vc_reconnect_latency_seconds").record(duration.as_secs_f64());
}

// ============================================================================
// Signaling
// ============================================================================

/// Record signaling message handling latency.
///
/// Metric: `vc_message_latency_seconds`
/// Labels: `message_type`
pub fn record_message_latency(message_type: &str, duration: Duration) {
    histogram!("vc_message_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record an error frame sent to a client.
///
/// Metric: `vc_errors_total`
/// Labels: `error_type` (from `VcError::error_type_label`)
pub fn record_error(error_type: &str) {
    counter!("vc_errors_total", "error_type" => error_type.to_string()).increment(1);
}

/// Record an outbound frame dropped because a connection mailbox was full.
///
/// Metric: `vc_frames_dropped_total`
pub fn record_frame_dropped() {
    counter!("vc_frames_dropped_total").increment(1);
}

/// Record the outcome of an opportunistic consumer creation.
///
/// Metric: `vc_auto_consume_total`
/// Labels: `outcome` (created, incompatible, failed)
pub fn record_auto_consume(outcome: &str) {
    counter!("vc_auto_consume_total", "outcome" => outcome.to_string()).increment(1);
}

// ============================================================================
// External collaborators
// ============================================================================

/// Record a backend validation call.
///
/// Emits:
/// - `vc_validation_total` counter (labels: `outcome`)
/// - `vc_backend_validation_duration_seconds` histogram
pub fn record_validation(outcome: &str, duration: Duration) {
    histogram!("vc_backend_validation_duration_seconds").record(duration.as_secs_f64());
    counter!("vc_validation_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a failed best-effort close.
///
/// Metric: `vc_engine_close_failures_total`
/// Labels: `resource` (transport, producer, consumer)
pub fn record_engine_close_failure(resource: &str) {
    counter!("vc_engine_close_failures_total", "resource" => resource.to_string()).increment(1);
}

/// Record an interop relay event.
///
/// Metric: `vc_interop_events_total`
/// Labels: `status` (sent, dropped, received)
pub fn record_interop_event(status: &str) {
    counter!("vc_interop_events_total", "status" => status.to_string()).increment(1);
}
