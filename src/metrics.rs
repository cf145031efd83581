// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Session state
//! - Peer requests by endpoint and outcome
//! - Retries and permanent failures
//! - Revisions pushed and pulled
//! - Checkpoint saves and conflicts
//! - Batch sizes and durations
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
//! use doc_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_request("_bulk_docs", Some(201), Duration::from_millis(40));
//! metrics::record_batch("pusher", 100, Duration::from_millis(250));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Session Metrics
// =============================================================================

/// Gauge for replication state.
pub fn set_replication_state(state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Stopped" => 0.0,
        "Active" => 1.0,
        "Idle" => 2.0,
        "Offline" => 3.0,
        "Stopping" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_state").set(value);
}

/// Record a state transition.
pub fn record_state_transition(state: &str) {
    counter!("replication_state_transitions_total", "state" => state.to_string()).increment(1);
}

/// Number of open change-feed subscriptions.
pub fn set_feed_subscriptions(count: usize) {
    gauge!("replication_feed_subscriptions").set(count as f64);
}

/// Record the outcome of the pre-flight handshake.
pub fn record_auth(outcome: &str) {
    counter!("replication_auth_total", "outcome" => outcome.to_string()).increment(1);
}

// =============================================================================
// Request Metrics
// =============================================================================

/// Record one HTTP exchange with the peer. `status` is `None` for
/// network-level failures.
pub fn record_request(endpoint: &str, status: Option<u16>, duration: Duration) {
    let status = status.map_or_else(|| "network_error".to_string(), |s| s.to_string());
    counter!(
        "replication_requests_total",
        "endpoint" => endpoint.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("replication_request_duration_seconds", "endpoint" => endpoint.to_string())
        .record(duration.as_secs_f64());
}

/// Record a retried transient failure.
pub fn record_retry(operation: &str) {
    counter!("replication_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record items that failed permanently.
pub fn record_permanent_failures(role: &str, count: usize) {
    if count > 0 {
        counter!("replication_permanent_failures_total", "role" => role.to_string())
            .increment(count as u64);
    }
}

// =============================================================================
// Revision Metrics
// =============================================================================

/// Record revisions acknowledged by the peer.
pub fn record_revisions_pushed(count: usize) {
    counter!("replication_revisions_pushed_total").increment(count as u64);
}

/// Record revisions applied locally.
pub fn record_revisions_pulled(count: usize) {
    counter!("replication_revisions_pulled_total").increment(count as u64);
}

// =============================================================================
// Checkpoint Metrics
// =============================================================================

/// Record a remote checkpoint save.
pub fn record_checkpoint_save(role: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_checkpoint_saves_total",
        "role" => role.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a checkpoint conflict (409 from the peer).
pub fn record_checkpoint_conflict(role: &str) {
    counter!("replication_checkpoint_conflicts_total", "role" => role.to_string()).increment(1);
}

/// Record mirror flush stats.
pub fn record_mirror_flush(flushed: usize, errors: usize) {
    counter!("replication_mirror_flushed_total").increment(flushed as u64);
    if errors > 0 {
        counter!("replication_mirror_flush_errors_total").increment(errors as u64);
    }
}

/// Record a SQLite busy retry in the checkpoint mirror.
pub fn record_mirror_retry(operation: &str) {
    counter!("replication_mirror_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Batch Metrics
// =============================================================================

/// Record a processed batch.
pub fn record_batch(role: &str, size: usize, duration: Duration) {
    histogram!("replication_batch_size", "role" => role.to_string()).record(size as f64);
    histogram!("replication_batch_duration_seconds", "role" => role.to_string())
        .record(duration.as_secs_f64());
}
