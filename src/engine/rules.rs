//! Device finalization rules.
//!
//! After every recorded decision the decision's device is checked:
//!
//! 1. YES rule: a positive finding closes the device as `yes` at once.
//! 2. Pattern rule: when the last three completed results in variant order
//!    are negative, skip, skip, the device closes as `no`.
//!
//! Closing a device marks all of its remaining reviews `done` with a
//! synthetic code, including reviews leased to other workers. Both closes
//! only touch rows that are not yet done, and a device verdict once set is
//! never replaced, so re-triggering a rule is harmless.

use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::*;
use crate::storage::TxContext;
use crate::telemetry::metrics;

/// Decision source recorded when the pattern rule closes a device.
pub const PATTERN_RULE_SOURCE: &str = "repeated_skip_rule";

/// The worker labels the rules react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleLabels {
    pub positive: ResultLabel,
    pub negative: ResultLabel,
    pub skip: ResultLabel,
}

impl Default for RuleLabels {
    fn default() -> Self {
        Self {
            positive: ResultLabel::new("yes"),
            negative: ResultLabel::new("no"),
            skip: ResultLabel::new("skip"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    DeviceYes,
    RepeatedSkipPattern,
}

impl Rule {
    pub fn code(self) -> SyntheticCode {
        match self {
            Rule::DeviceYes => SyntheticCode::AutoSkipDeviceYes,
            Rule::RepeatedSkipPattern => SyntheticCode::RepeatedSkipPattern,
        }
    }

    pub fn verdict(self) -> DeviceVerdict {
        match self {
            Rule::DeviceYes => DeviceVerdict::Yes,
            Rule::RepeatedSkipPattern => DeviceVerdict::No,
        }
    }

    fn notes(self) -> &'static str {
        match self {
            Rule::DeviceYes => "triggered_by: yes_decision",
            Rule::RepeatedSkipPattern => "triggered_by: repeated_skip_pattern",
        }
    }
}

/// What a fired rule changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finalization {
    pub rule: Rule,
    pub device_id: String,
    /// Reviews force-closed with the rule's synthetic code.
    pub closed_reviews: usize,
    /// False when the device already had a verdict.
    pub verdict_written: bool,
}

/// The recorded decision the rules evaluate.
#[derive(Debug, Clone)]
pub(crate) struct Trigger<'a> {
    pub image_id: ImageId,
    pub device_id: &'a str,
    pub worker: &'a str,
    pub lease_id: LeaseId,
    pub result: &'a ResultLabel,
    pub standard_version: &'a str,
}

/// True when the last three results, in variant order, are
/// negative, skip, skip.
pub fn matches_skip_pattern(labels: &RuleLabels, history: &[(String, ResultLabel)]) -> bool {
    let [.., (_, a), (_, b), (_, c)] = history else {
        return false;
    };
    *a == labels.negative && *b == labels.skip && *c == labels.skip
}

/// Evaluate both rules for the trigger's device and apply the first that
/// fires. Runs inside the caller's transaction, so the history read and the
/// close-out cannot interleave with another writer's decision.
pub(crate) fn apply(
    ctx: &TxContext,
    labels: &RuleLabels,
    trigger: &Trigger,
) -> Result<Option<Finalization>> {
    let (rule, source) = if *trigger.result == labels.positive {
        (Rule::DeviceYes, trigger.image_id.to_string())
    } else {
        let history = ctx.device_history(trigger.device_id)?;
        debug!(
            device_id = trigger.device_id,
            decided = history.len(),
            "evaluating skip pattern"
        );
        if !matches_skip_pattern(labels, &history) {
            return Ok(None);
        }
        (Rule::RepeatedSkipPattern, PATTERN_RULE_SOURCE.to_string())
    };

    let closed_reviews = ctx.close_remaining(
        trigger.device_id,
        rule.code(),
        trigger.worker,
        trigger.lease_id,
        trigger.standard_version,
    )?;
    let verdict_written = ctx.set_verdict(trigger.device_id, rule.verdict(), &source, rule.notes())?;

    info!(
        device_id = trigger.device_id,
        rule = ?rule,
        closed_reviews,
        verdict_written,
        "device finalized"
    );
    if verdict_written {
        metrics::devices_finalized().add(1, &[KeyValue::new("rule", rule.code().as_str())]);
    }

    Ok(Some(Finalization {
        rule,
        device_id: trigger.device_id.to_string(),
        closed_reviews,
        verdict_written,
    }))
}
