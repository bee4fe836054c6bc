//! Metric instrument factories for review-lease.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"review-lease"` meter.
//! Without an installed provider every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for review-lease instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("review-lease")
}

/// Counter: reviews moved into `in_progress` by leasing.
/// Labels: `pool` ("qc" | "topup").
pub fn reviews_leased() -> Counter<u64> {
    meter()
        .u64_counter("review.leased")
        .with_description("Number of reviews leased to workers")
        .build()
}

/// Counter: release calls.
pub fn leases_released() -> Counter<u64> {
    meter()
        .u64_counter("review.lease.released")
        .with_description("Number of lease release calls")
        .build()
}

/// Counter: decision submissions.
/// Labels: `outcome` ("recorded" | "stale").
pub fn decisions_recorded() -> Counter<u64> {
    meter()
        .u64_counter("review.decisions")
        .with_description("Number of decisions submitted")
        .build()
}

/// Counter: review status transitions.
/// Labels: `from`, `to`.
pub fn review_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("review.state_transitions")
        .with_description("Number of review status transitions")
        .build()
}

/// Counter: devices given a final verdict.
/// Labels: `rule`.
pub fn devices_finalized() -> Counter<u64> {
    meter()
        .u64_counter("review.devices.finalized")
        .with_description("Number of devices given a final verdict")
        .build()
}

/// Counter: click annotations stored.
/// Labels: `button`.
pub fn annotations_added() -> Counter<u64> {
    meter()
        .u64_counter("review.annotations")
        .with_description("Number of annotations stored")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("review.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
