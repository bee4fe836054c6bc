//! Two-variant pair linkage.
//!
//! Devices captured as a `_000` primary and a `_001` sibling in the same
//! directory can link the sibling's review to the primary's decision:
//! either skip it outright or pull it into the current lease so it is
//! reviewed next.

use serde::Serialize;
use tracing::info;

use super::{Engine, require_worker};
use crate::error::Result;
use crate::model::*;
use crate::telemetry::review::{record_lease, record_state_transition, start_review_span};

const PRIMARY_SUFFIXES: [(&str, &str); 2] = [("_000.jpg", "_001.jpg"), ("_000.jpeg", "_001.jpeg")];

/// Sibling path of a primary image, or `None` if `path` is not a primary.
///
/// The suffix match ignores ASCII case. Everything before the suffix is
/// kept as is; the sibling suffix is always written in lowercase, so
/// `ABC_000.JPG` pairs with `ABC_001.jpg`.
pub fn pair_path(path: &str) -> Option<String> {
    PRIMARY_SUFFIXES.iter().find_map(|(primary, sibling)| {
        let cut = path.len().checked_sub(primary.len())?;
        if !path.is_char_boundary(cut) || !path[cut..].eq_ignore_ascii_case(primary) {
            return None;
        }
        Some(format!("{}{sibling}", &path[..cut]))
    })
}

/// What to do with the sibling once the primary is decided. Callers pick
/// one per decision; the two never run together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPolicy {
    /// Close the sibling's open review as skip.
    AutoSkip,
    /// Lease the sibling's open review into the current lease.
    AssignNow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairOutcome {
    /// Not a primary path, or the sibling has no open review.
    NoPair,
    Skipped(ReviewId),
    Assigned(LeasedItem),
    /// The sibling's review is held by another worker, or this worker
    /// already reviewed the same image.
    Busy(ReviewId),
}

impl Engine {
    /// Apply `policy` to the sibling of `primary_path`.
    pub fn link_pair(
        &mut self,
        policy: PairPolicy,
        primary_path: &str,
        worker: &str,
        lease_id: LeaseId,
        standard_version: &str,
    ) -> Result<PairOutcome> {
        match policy {
            PairPolicy::AutoSkip => {
                self.auto_skip_pair(primary_path, worker, lease_id, standard_version)
            }
            PairPolicy::AssignNow => self.assign_pair_now(primary_path, worker, lease_id),
        }
    }

    /// Close the sibling's earliest open review as skip, stamped with this
    /// worker, lease and version. The sibling never has to be leased.
    /// A missing sibling or one already done is a no-op.
    pub fn auto_skip_pair(
        &mut self,
        primary_path: &str,
        worker: &str,
        lease_id: LeaseId,
        standard_version: &str,
    ) -> Result<PairOutcome> {
        require_worker(worker)?;
        let Some(sibling) = pair_path(primary_path) else {
            return Ok(PairOutcome::NoPair);
        };

        let span = start_review_span("auto_skip_pair", worker);
        record_lease(&span, lease_id);

        let skip = &self.options.labels.skip;
        let outcome = self.storage.with_transaction(|ctx| {
            let Some((review_id, status)) = ctx.open_review_for_path(&sibling)? else {
                return Ok(None);
            };
            let updated = ctx.force_skip(review_id, skip, worker, lease_id, standard_version)?;
            Ok((updated > 0).then_some((review_id, status)))
        })?;

        let Some((review_id, from)) = outcome else {
            return Ok(PairOutcome::NoPair);
        };
        record_state_transition(&span, review_id, from.as_str(), "done");
        span.in_scope(|| info!(sibling = %sibling, review_id = %review_id, "pair auto-skipped"));
        Ok(PairOutcome::Skipped(review_id))
    }

    /// Lease the sibling's earliest open review to this worker under
    /// `lease_id` so it is reviewed next.
    pub fn assign_pair_now(
        &mut self,
        primary_path: &str,
        worker: &str,
        lease_id: LeaseId,
    ) -> Result<PairOutcome> {
        require_worker(worker)?;
        let Some(sibling) = pair_path(primary_path) else {
            return Ok(PairOutcome::NoPair);
        };

        let span = start_review_span("assign_pair_now", worker);
        record_lease(&span, lease_id);

        let outcome = self.storage.with_transaction(|ctx| {
            let Some((review_id, status)) = ctx.open_review_for_path(&sibling)? else {
                return Ok(PairOutcome::NoPair);
            };
            if ctx.assign(review_id, worker, lease_id)? == 0 {
                return Ok(PairOutcome::Busy(review_id));
            }
            if status == ReviewStatus::Unassigned {
                record_state_transition(&span, review_id, status.as_str(), "in_progress");
            }
            ctx.leased_item(review_id).map(PairOutcome::Assigned)
        })?;

        span.in_scope(|| info!(sibling = %sibling, outcome = ?outcome, "pair assignment"));
        Ok(outcome)
    }
}
