//! Core engine. The public API the review front-end talks to.
//!
//! The engine owns the storage and enforces every row-level precondition.
//! Transitions into `in_progress` happen in [`lease`], transitions into
//! `done` happen in [`Engine::record_decision`] and, for whole devices, in
//! [`rules`].

pub mod lease;
pub mod pair;
pub mod rules;

use std::path::Path;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::*;
use crate::storage::{RegisterOutcome, Storage, StoreOptions};
use crate::telemetry::metrics;
use crate::telemetry::review::{record_lease, record_state_transition, start_review_span};

pub use lease::{Lease, ReleaseOutcome, qc_target};
pub use pair::{PairOutcome, PairPolicy, pair_path};
pub use rules::{Finalization, Rule, RuleLabels};

/// Engine settings. Usually built from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub store: StoreOptions,
    /// Labels the rules key on.
    pub labels: RuleLabels,
    /// Worker labels accepted by [`Engine::record_decision`]. Empty accepts
    /// any label that is not a synthetic code.
    pub allowed_results: Vec<ResultLabel>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let labels = RuleLabels::default();
        let allowed_results = vec![
            labels.positive.clone(),
            labels.negative.clone(),
            labels.skip.clone(),
        ];
        Self {
            store: StoreOptions::default(),
            labels,
            allowed_results,
        }
    }
}

impl EngineOptions {
    /// Reject labels a worker may not submit.
    pub fn validate_label(&self, label: &ResultLabel) -> Result<()> {
        if label.as_str().trim().is_empty() {
            return Err(Error::UnknownLabel("empty label".to_string()));
        }
        if let Some(code) = label.synthetic() {
            return Err(Error::UnknownLabel(format!(
                "{code} is reserved for device rules"
            )));
        }
        if !self.allowed_results.is_empty() && !self.allowed_results.contains(label) {
            return Err(Error::UnknownLabel(label.to_string()));
        }
        Ok(())
    }
}

/// Whether a decision write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The review is now `done` with the submitted result.
    Recorded,
    /// The review is no longer in progress under this worker and lease.
    /// Nothing was written; the caller should re-fetch state.
    Stale,
}

/// What the device rules did after a recorded decision.
#[derive(Debug)]
pub enum FinalizationReport {
    /// Rules were not evaluated because the decision was stale.
    NotEvaluated,
    /// Rules ran; none applied.
    NoRuleFired,
    Fired(Finalization),
    /// Rules failed. The decision itself stands.
    Failed(Error),
}

/// Result of [`Engine::record_decision`].
#[derive(Debug)]
pub struct Decision {
    pub outcome: RecordOutcome,
    pub finalization: FinalizationReport,
}

impl Decision {
    pub fn is_recorded(&self) -> bool {
        self.outcome == RecordOutcome::Recorded
    }
}

/// The review engine. Owns the store connection and enforces all invariants.
pub struct Engine {
    storage: Storage,
    options: EngineOptions,
}

impl Engine {
    /// Create an engine with in-memory storage (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with(EngineOptions::default())
    }

    pub fn in_memory_with(options: EngineOptions) -> Result<Self> {
        Ok(Self {
            storage: Storage::in_memory()?,
            options,
        })
    }

    /// Create an engine backed by a store file, migrating it if needed.
    pub fn open(path: impl AsRef<Path>, options: EngineOptions) -> Result<Self> {
        Ok(Self {
            storage: Storage::open(path, &options.store)?,
            options,
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Read-only access to the store.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Re-run migrations. Idempotent.
    pub fn migrate(&mut self) -> Result<i64> {
        self.storage.migrate()
    }

    /// Register one image and seed its review rows.
    pub fn register_image(&mut self, new: NewImage) -> Result<RegisterOutcome> {
        if new.path.is_empty() || new.device_id.is_empty() || new.content_digest.is_empty() {
            return Err(Error::InvalidArgument(
                "path, device id and content digest are required".to_string(),
            ));
        }
        self.storage.with_transaction(|ctx| ctx.register_image(&new))
    }

    /// Record a terminal decision for one leased review, then apply the
    /// device rules.
    ///
    /// The decision commits on its own before the rules run. A failure in
    /// the rules is returned inside [`Decision::finalization`] and never
    /// undoes the decision.
    pub fn record_decision(
        &mut self,
        review_id: ReviewId,
        worker: &str,
        lease_id: LeaseId,
        result: &ResultLabel,
        ruleset_version: &str,
    ) -> Result<Decision> {
        require_worker(worker)?;
        self.options.validate_label(result)?;

        let span = start_review_span("record_decision", worker);
        record_lease(&span, lease_id);
        let started = Instant::now();

        let subject = self.storage.with_transaction(|ctx| {
            let updated =
                ctx.record_decision(review_id, worker, lease_id, result, ruleset_version)?;
            if updated == 0 {
                return Ok(None);
            }
            ctx.leased_item(review_id).map(Some)
        })?;

        let Some(item) = subject else {
            span.in_scope(|| {
                warn!(review_id = %review_id, "stale lease, decision not recorded");
            });
            metrics::decisions_recorded().add(1, &[KeyValue::new("outcome", "stale")]);
            return Ok(Decision {
                outcome: RecordOutcome::Stale,
                finalization: FinalizationReport::NotEvaluated,
            });
        };

        record_state_transition(&span, review_id, "in_progress", "done");
        metrics::decisions_recorded().add(1, &[KeyValue::new("outcome", "recorded")]);

        let trigger = rules::Trigger {
            image_id: item.image_id,
            device_id: &item.device_id,
            worker,
            lease_id,
            result,
            standard_version: ruleset_version,
        };

        let labels = &self.options.labels;
        let finalization = match self
            .storage
            .with_transaction(|ctx| rules::apply(ctx, labels, &trigger))
        {
            Ok(Some(fired)) => FinalizationReport::Fired(fired),
            Ok(None) => FinalizationReport::NoRuleFired,
            Err(e) => {
                span.in_scope(|| {
                    warn!(device_id = %item.device_id, error = %e, "device finalization failed");
                });
                FinalizationReport::Failed(e)
            }
        };

        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "record_decision")],
        );

        Ok(Decision {
            outcome: RecordOutcome::Recorded,
            finalization,
        })
    }

    /// Close every open device whose reviews are all done as `unknown`.
    ///
    /// Meant to run when leasing comes back empty. Returns the devices closed.
    pub fn finalize_exhausted_devices(&mut self) -> Result<Vec<String>> {
        let closed = self.storage.with_transaction(|ctx| ctx.finalize_exhausted())?;
        if !closed.is_empty() {
            info!(devices = closed.len(), "exhausted devices closed as unknown");
            metrics::devices_finalized().add(
                closed.len() as u64,
                &[KeyValue::new("rule", "pool_exhausted")],
            );
        }
        Ok(closed)
    }

    /// Store one click annotation for a review.
    pub fn add_annotation(
        &mut self,
        review_id: ReviewId,
        x_norm: f64,
        y_norm: f64,
        button: MouseButton,
    ) -> Result<i64> {
        for (axis, v) in [("x", x_norm), ("y", y_norm)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::InvalidArgument(format!(
                    "{axis} coordinate {v} outside [0, 1]"
                )));
            }
        }

        let id = self
            .storage
            .with_transaction(|ctx| ctx.add_annotation(review_id, x_norm, y_norm, button))?;
        metrics::annotations_added().add(1, &[KeyValue::new("button", button.as_str())]);
        Ok(id)
    }

    /// Completed `(variant, result)` pairs for a device, variant order.
    pub fn device_history(&self, device_id: &str) -> Result<Vec<(String, ResultLabel)>> {
        self.storage.device_history(device_id)
    }

    pub fn device(&self, device_id: &str) -> Result<Device> {
        self.storage.get_device(device_id)
    }

    pub fn review(&self, review_id: ReviewId) -> Result<Review> {
        self.storage.get_review(review_id)
    }
}

pub(crate) fn require_worker(worker: &str) -> Result<()> {
    if worker.trim().is_empty() {
        return Err(Error::InvalidArgument("worker identity is empty".to_string()));
    }
    Ok(())
}
