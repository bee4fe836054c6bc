//! Review operation span helpers.
//!
//! One span per engine call. The lease id is declared empty and filled in
//! once known, so spans for a whole leasing episode can be correlated.

use tracing::Span;

use crate::model::{LeaseId, ReviewId};

/// Start a span for one engine operation on behalf of `worker`.
pub fn start_review_span(operation: &str, worker: &str) -> Span {
    tracing::info_span!(
        "review.operation",
        "review.operation" = operation,
        "review.worker" = worker,
        "review.lease" = tracing::field::Empty,
    )
}

pub fn record_lease(span: &Span, lease_id: LeaseId) {
    span.record("review.lease", tracing::field::display(lease_id));
}

/// Record a review status transition on the given span.
pub fn record_state_transition(span: &Span, review_id: ReviewId, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(review_id = review_id.0, from = from, to = to, "state_transition");
    });
    super::metrics::review_state_transitions().add(
        1,
        &[
            opentelemetry::KeyValue::new("from", from.to_string()),
            opentelemetry::KeyValue::new("to", to.to_string()),
        ],
    );
}
