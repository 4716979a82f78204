// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Records, through the `metrics` facade:
//! - Broker connection attempts and connectivity per role
//! - Published events and fan-out completeness
//! - Broadcasts suppressed by the loop guard
//! - Delivery dispositions and replay latency
//! - Node lifecycle state and store retries
//!
//! No exporter is installed here; the embedding process chooses one.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use logistics_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_event_published("warehouse.created", "B", true);
//! metrics::record_replay_latency("POST", Duration::from_millis(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Broker
// =============================================================================

/// Record a broker connection attempt.
pub fn record_broker_connection(role: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_broker_connections_total", "role" => role.to_string(), "status" => status).increment(1);
}

/// Whether the connection for `role` is currently up.
pub fn set_broker_connected(role: &str, connected: bool) {
    gauge!("replication_broker_connected", "role" => role.to_string()).set(if connected { 1.0 } else { 0.0 });
}

// =============================================================================
// Publishing
// =============================================================================

/// Record one per-peer publish attempt.
pub fn record_event_published(event_type: &str, peer: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_events_published_total",
        "event_type" => event_type.to_string(),
        "peer_id" => peer.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record one fan-out (all peers of one mutation).
pub fn record_fan_out(event_type: &str, attempted: usize, failed: usize) {
    histogram!("replication_fan_out_size", "event_type" => event_type.to_string()).record(attempted as f64);
    if failed > 0 {
        counter!("replication_fan_out_incomplete_total", "event_type" => event_type.to_string()).increment(1);
    }
}

/// Record a mutation that was not broadcast because it was itself a replay.
pub fn record_broadcast_suppressed(event_type: &str, source: &str) {
    counter!(
        "replication_broadcasts_suppressed_total",
        "event_type" => event_type.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

// =============================================================================
// Consuming
// =============================================================================

/// Record the terminal state of one delivery.
pub fn record_delivery(disposition: &str) {
    counter!("replication_deliveries_total", "disposition" => disposition.to_string()).increment(1);
}

/// Record replay call latency.
pub fn record_replay_latency(method: &str, duration: Duration) {
    histogram!("replication_replay_duration_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Node & store
// =============================================================================

/// Gauge for node state.
pub fn set_node_state(state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replication_node_state").set(value);
}

/// Number of configured peers.
pub fn set_peer_count(count: usize) {
    gauge!("replication_peers").set(count as f64);
}

/// Record a SQLite busy retry.
pub fn record_store_retry(operation: &str) {
    counter!("replication_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record an error by kind.
pub fn record_error(error_type: &str) {
    counter!("replication_errors_total", "error_type" => error_type.to_string()).increment(1);
}
