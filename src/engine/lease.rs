//! Batch leasing and release.
//!
//! A lease is a set of review rows stamped with one worker and one fresh
//! lease id inside a single IMMEDIATE transaction. Two workers leasing at
//! the same time serialize on the store lock, and the second one's
//! selection already sees the first one's rows as `in_progress`.

use std::time::Instant;

use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::info;

use super::{Engine, require_worker};
use crate::error::{Error, Result};
use crate::model::*;
use crate::storage::Pool;
use crate::telemetry::metrics;
use crate::telemetry::review::{record_lease, start_review_span};

/// A batch of reviews leased to one worker.
#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    pub id: LeaseId,
    pub worker: String,
    /// Variant order, shuffled within a variant. Empty means the pool is
    /// exhausted for this worker.
    pub items: Vec<LeasedItem>,
    /// How many of the items came from the QC pool.
    pub qc_drawn: usize,
}

impl Lease {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Result of [`Engine::release_lease`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReleaseOutcome {
    /// Rows returned to the pool. Zero when the lease was already released,
    /// fully decided, or never belonged to this worker.
    pub released: usize,
}

/// QC share of a batch: `max(1, round(desired * fraction))`, never more
/// than the batch itself.
pub fn qc_target(desired_count: usize, qc_fraction: f64) -> usize {
    let share = (desired_count as f64 * qc_fraction).round() as usize;
    share.max(1).min(desired_count)
}

impl Engine {
    /// Lease up to `desired_count` unassigned reviews to `worker`.
    ///
    /// Draws first from the QC pool up to [`qc_target`], then tops up from
    /// the rest of the pool. QC rows are allowed into the top-up only when
    /// the QC pool came up short. A worker never holds two reviews of the
    /// same image. Fewer items than requested, down to none, is a normal
    /// result.
    pub fn lease_batch(
        &mut self,
        worker: &str,
        desired_count: usize,
        qc_fraction: f64,
    ) -> Result<Lease> {
        require_worker(worker)?;
        if !(0.0..=1.0).contains(&qc_fraction) {
            return Err(Error::InvalidArgument(format!(
                "qc fraction {qc_fraction} outside [0, 1]"
            )));
        }

        let lease_id = LeaseId::new();
        if desired_count == 0 {
            return Ok(Lease {
                id: lease_id,
                worker: worker.to_string(),
                items: Vec::new(),
                qc_drawn: 0,
            });
        }

        let span = start_review_span("lease_batch", worker);
        record_lease(&span, lease_id);
        let started = Instant::now();
        let qc_wanted = qc_target(desired_count, qc_fraction);

        let (qc_drawn, topped_up, items) = self.storage.with_transaction(|ctx| {
            let qc = ctx.lease_from_pool(Pool::Qc, worker, lease_id, qc_wanted)?;
            let include_qc = qc.len() < qc_wanted;
            let topup = ctx.lease_from_pool(
                Pool::TopUp { include_qc },
                worker,
                lease_id,
                desired_count - qc.len(),
            )?;
            let items = ctx.leased_items(worker, lease_id)?;
            Ok((qc.len(), topup.len(), items))
        })?;

        span.in_scope(|| {
            info!(
                requested = desired_count,
                qc_wanted,
                qc_drawn,
                topped_up,
                "batch leased"
            );
        });
        metrics::reviews_leased().add(qc_drawn as u64, &[KeyValue::new("pool", "qc")]);
        metrics::reviews_leased().add(topped_up as u64, &[KeyValue::new("pool", "topup")]);
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "lease_batch")],
        );

        Ok(Lease {
            id: lease_id,
            worker: worker.to_string(),
            items,
            qc_drawn,
        })
    }

    /// Return every review still in progress under `(lease_id, worker)` to
    /// the pool. Done rows are never touched; repeating the call is a no-op.
    pub fn release_lease(&mut self, worker: &str, lease_id: LeaseId) -> Result<ReleaseOutcome> {
        let span = start_review_span("release_lease", worker);
        record_lease(&span, lease_id);

        let released = self
            .storage
            .with_transaction(|ctx| ctx.release(worker, lease_id))?;

        span.in_scope(|| info!(released, "lease released"));
        metrics::leases_released().add(1, &[]);

        Ok(ReleaseOutcome { released })
    }
}
