//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Binlog events read, applied, and skipped
//! - Change-queue depth
//! - Batch flush performance
//! - Conflicts detected and resolved
//! - Listener reconnects and quarantined tables
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `dbsync_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record binlog events decoded and forwarded by a listener.
pub fn record_events_read(direction: &str, count: usize) {
    counter!("dbsync_events_read_total", "direction" => direction.to_string())
        .increment(count as u64);
}

/// Record rows applied at the destination for a table.
pub fn record_rows_applied(table: &str, count: u64) {
    counter!("dbsync_rows_applied_total", "table" => table.to_string()).increment(count);
}

/// Record rows skipped due to data-shape errors.
pub fn record_rows_skipped(table: &str, count: u64) {
    counter!("dbsync_rows_skipped_total", "table" => table.to_string()).increment(count);
}

/// Set the current change-queue depth.
pub fn set_queue_depth(depth: usize) {
    gauge!("dbsync_queue_depth").set(depth as f64);
}

/// Record a batch flush for a table.
pub fn record_batch_flush(table: &str, rows: usize, duration: Duration) {
    counter!("dbsync_batches_flushed_total", "table" => table.to_string()).increment(1);
    histogram!("dbsync_batch_rows", "table" => table.to_string()).record(rows as f64);
    histogram!("dbsync_batch_flush_duration_seconds", "table" => table.to_string())
        .record(duration.as_secs_f64());
}

/// Record a position advance for a table.
pub fn record_position_advance(table: &str) {
    counter!("dbsync_position_advances_total", "table" => table.to_string()).increment(1);
}

/// Record a detected conflict.
pub fn record_conflict(table: &str, kind: &str) {
    counter!("dbsync_conflicts_detected_total", "table" => table.to_string(), "kind" => kind.to_string())
        .increment(1);
}

/// Record a resolved conflict by strategy.
pub fn record_conflict_resolved(table: &str, strategy: &str) {
    counter!("dbsync_conflicts_resolved_total", "table" => table.to_string(), "strategy" => strategy.to_string())
        .increment(1);
}

/// Record a listener reconnect attempt.
pub fn record_reconnect(direction: &str) {
    counter!("dbsync_listener_reconnects_total", "direction" => direction.to_string())
        .increment(1);
}

/// Record a state-store retry.
pub fn record_store_retry(operation: &str) {
    counter!("dbsync_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Set whether a table is quarantined (1) or healthy (0).
pub fn set_table_quarantined(table: &str, quarantined: bool) {
    gauge!("dbsync_table_quarantined", "table" => table.to_string())
        .set(if quarantined { 1.0 } else { 0.0 });
}

/// Set the manager state gauge (one-hot by state label).
pub fn set_manager_state(state: &str) {
    gauge!("dbsync_manager_state", "state" => state.to_string()).set(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics facade is a no-op without an installed recorder; these
    // tests only assert the calls don't panic.

    #[test]
    fn test_counters_no_recorder() {
        record_events_read("local_to_cloud", 10);
        record_rows_applied("users", 5);
        record_rows_skipped("users", 1);
        record_position_advance("users");
        record_conflict("users", "data_mismatch");
        record_conflict_resolved("users", "last_write_wins");
        record_reconnect("cloud_to_local");
        record_store_retry("upsert_position");
    }

    #[test]
    fn test_gauges_and_histograms_no_recorder() {
        set_queue_depth(42);
        set_table_quarantined("orders", true);
        set_table_quarantined("orders", false);
        set_manager_state("running");
        record_batch_flush("users", 100, Duration::from_millis(50));
    }
}
