// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for facility-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding server is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `facility_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `outcome`: authenticated, bad_secret, created, updated, ...
//! - `record_type`: patient, visit, ...
//! - `trigger`: sweep, change, subscribe, manual
//! - `error_type`: see [`SyncError::kind`](crate::SyncError::kind)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// INBOUND - Authentication and merge
// ═══════════════════════════════════════════════════════════════════════════

/// Record a channel authentication attempt
pub fn record_auth(outcome: &str) {
    counter!(
        "facility_sync_auth_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an applied inbound operation
pub fn record_merge(record_type: &str, outcome: &str) {
    counter!(
        "facility_sync_merges_total",
        "record_type" => record_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record fields where the existing value beat the incoming one
pub fn record_field_conflicts(record_type: &str, rejected: usize) {
    if rejected == 0 {
        return;
    }
    counter!(
        "facility_sync_field_conflicts_total",
        "record_type" => record_type.to_string()
    )
    .increment(rejected as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// OUTBOUND - Batches and watermarks
// ═══════════════════════════════════════════════════════════════════════════

/// Record a client sync batch outcome
pub fn record_sync_batch(trigger: &str, status: &str) {
    counter!(
        "facility_sync_batches_total",
        "trigger" => trigger.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record published changes
pub fn record_changes_published(count: usize) {
    counter!("facility_sync_changes_published_total").increment(count as u64);
}

/// Record changes skipped by mode, filter or a vanished record
pub fn record_changes_skipped(reason: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "facility_sync_changes_skipped_total",
        "reason" => reason.to_string()
    )
    .increment(count as u64);
}

/// Record batch size (changes fetched past the watermark)
pub fn record_batch_size(count: usize) {
    histogram!("facility_sync_batch_size").record(count as f64);
}

/// Record a client entering backoff
pub fn record_backoff(delay: Duration) {
    counter!("facility_sync_backoffs_total").increment(1);
    histogram!("facility_sync_backoff_seconds").record(delay.as_secs_f64());
}

/// Record a finished sweep
pub fn record_sweep(clients: usize, failed: usize) {
    counter!("facility_sync_sweeps_total").increment(1);
    gauge!("facility_sync_active_clients").set(clients as f64);
    gauge!("facility_sync_sweep_failed_clients").set(failed as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with category for alerting
pub fn record_error(operation: &str, error_type: &str) {
    counter!(
        "facility_sync_errors_total",
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Track server state transitions
pub fn set_server_state(state: &str) {
    counter!(
        "facility_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "facility_sync_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These verify the API doesn't panic without a recorder installed.
    // The demo installs metrics-util's DebuggingRecorder for real output.

    #[test]
    fn test_inbound_metrics() {
        record_auth("authenticated");
        record_auth("bad_secret");
        record_merge("patient", "created");
        record_field_conflicts("patient", 2);
        record_field_conflicts("patient", 0);
    }

    #[test]
    fn test_outbound_metrics() {
        record_sync_batch("sweep", "delivered");
        record_changes_published(10);
        record_changes_skipped("filtered", 3);
        record_changes_skipped("filtered", 0);
        record_batch_size(13);
        record_backoff(Duration::from_secs(2));
        record_sweep(5, 1);
    }

    #[test]
    fn test_error_and_lifecycle_metrics() {
        record_error("sync_client", "transport_publish");
        set_server_state("Running");
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("merge");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }
}
