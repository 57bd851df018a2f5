//! Pool counters on the `metrics` facade
//!
//! - `keypool_selections_total` (counter): successful key selections
//! - `keypool_exhausted_total` (counter): full ring scans that found no
//!   admissible key
//! - `keypool_reports_total` (counter): caller feedback, label `outcome`
//!   (`success` | `failure`)
//!
//! Installing an exporter is the embedding service's job; without a
//! recorder these calls are no-ops.

/// Record a successful key selection.
pub(crate) fn record_selection() {
    metrics::counter!("keypool_selections_total").increment(1);
}

/// Record a full scan that exhausted the ring.
pub(crate) fn record_exhausted() {
    metrics::counter!("keypool_exhausted_total").increment(1);
}

/// Record caller feedback with its outcome label.
pub(crate) fn record_report(outcome: &'static str) {
    metrics::counter!("keypool_reports_total", "outcome" => outcome).increment(1);
}
