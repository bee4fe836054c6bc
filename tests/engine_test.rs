//! Integration tests for leasing, decisions and device rules.

use review_lease::engine::{Engine, EngineOptions, FinalizationReport, RecordOutcome, Rule};
use review_lease::error::Error;
use review_lease::model::*;
use review_lease::storage::{EXHAUSTED_SOURCE, RegisterOutcome};

const VERSION: &str = "v1.0";

fn test_engine() -> Engine {
    Engine::in_memory().expect("failed to create in-memory engine")
}

fn register(engine: &mut Engine, device: &str, variant: &str, qc: bool) -> ImageId {
    let path = format!("share/{device}/{device}_{variant}.jpg");
    let digest = format!("digest-{device}-{variant}");
    match engine
        .register_image(NewImage::new(path, device, variant, digest).qc(qc))
        .unwrap()
    {
        RegisterOutcome::Registered { image_id, .. } => image_id,
        other => panic!("expected Registered, got {other:?}"),
    }
}

fn item_for<'a>(items: &'a [LeasedItem], variant: &str) -> &'a LeasedItem {
    items
        .iter()
        .find(|item| item.path.ends_with(&format!("_{variant}.jpg")))
        .unwrap_or_else(|| panic!("no leased item for variant {variant}"))
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[test]
fn register_seeds_one_review_or_two_for_qc() {
    let mut engine = test_engine();
    let plain = register(&mut engine, "D1", "000", false);
    let qc = register(&mut engine, "D1", "001", true);

    assert_eq!(engine.storage().reviews_for_image(plain).unwrap().len(), 1);
    let qc_reviews = engine.storage().reviews_for_image(qc).unwrap();
    assert_eq!(qc_reviews.len(), 2);
    assert!(qc_reviews.iter().all(|r| r.status == ReviewStatus::Unassigned));
    assert!(!engine.device("D1").unwrap().is_closed());
}

#[test]
fn register_same_path_is_a_noop_and_same_digest_is_a_duplicate() {
    let mut engine = test_engine();
    let id = register(&mut engine, "D1", "000", false);

    let again = engine
        .register_image(NewImage::new("share/D1/D1_000.jpg", "D1", "000", "digest-D1-000"))
        .unwrap();
    assert_eq!(again, RegisterOutcome::AlreadyRegistered { image_id: id });

    let copy = engine
        .register_image(NewImage::new("elsewhere/copy.jpg", "D1", "000", "digest-D1-000"))
        .unwrap();
    assert_eq!(
        copy,
        RegisterOutcome::Duplicate {
            existing_path: "share/D1/D1_000.jpg".to_string()
        }
    );
    assert_eq!(engine.storage().reviews_for_image(id).unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Leasing
// ---------------------------------------------------------------------------

#[test]
fn lease_fills_requested_count_with_qc_share() {
    let mut engine = test_engine();
    for n in 0..26 {
        register(&mut engine, &format!("P{n:02}"), "000", false);
    }
    for n in 0..4 {
        register(&mut engine, &format!("Q{n:02}"), "000", true);
    }

    let lease = engine.lease_batch("alice", 20, 0.10).unwrap();
    assert_eq!(lease.items.len(), 20);
    assert_eq!(lease.qc_drawn, 2);
    assert_eq!(lease.items.iter().filter(|i| i.qc_flag).count(), 2);

    for item in &lease.items {
        let review = engine.review(item.review_id).unwrap();
        assert_eq!(review.status, ReviewStatus::InProgress);
        assert_eq!(review.assigned_to.as_deref(), Some("alice"));
        assert_eq!(review.lease_id, Some(lease.id));
    }
}

#[test]
fn lease_tops_up_from_qc_when_qc_pool_runs_short() {
    let mut engine = test_engine();
    for n in 0..3 {
        register(&mut engine, &format!("Q{n}"), "000", true);
    }

    // Six QC rows on three images: one per image for this worker.
    let lease = engine.lease_batch("alice", 6, 1.0).unwrap();
    assert_eq!(lease.items.len(), 3);
    let mut images: Vec<_> = lease.items.iter().map(|i| i.image_id).collect();
    images.sort();
    images.dedup();
    assert_eq!(images.len(), 3);
}

#[test]
fn lease_returns_partial_and_then_empty_batches() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "000", false);
    register(&mut engine, "D1", "001", false);

    let first = engine.lease_batch("alice", 5, 0.10).unwrap();
    assert_eq!(first.items.len(), 2);

    let second = engine.lease_batch("bob", 5, 0.10).unwrap();
    assert!(second.is_empty());
}

#[test]
fn lease_orders_items_by_variant() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "002", false);
    register(&mut engine, "D1", "000", false);
    register(&mut engine, "D1", "001", false);

    let lease = engine.lease_batch("alice", 3, 0.0).unwrap();
    let paths: Vec<&str> = lease.items.iter().map(|i| i.path.as_str()).collect();
    assert_eq!(
        paths,
        ["share/D1/D1_000.jpg", "share/D1/D1_001.jpg", "share/D1/D1_002.jpg"]
    );
}

#[test]
fn lease_rejects_bad_arguments() {
    let mut engine = test_engine();
    assert!(matches!(
        engine.lease_batch("alice", 5, 1.5),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.lease_batch(" ", 5, 0.1),
        Err(Error::InvalidArgument(_))
    ));
    assert!(engine.lease_batch("alice", 0, 0.1).unwrap().is_empty());
}

#[test]
fn worker_never_holds_both_qc_reviews_of_an_image() {
    let mut engine = test_engine();
    register(&mut engine, "Q1", "000", true);

    let first = engine.lease_batch("alice", 5, 0.5).unwrap();
    assert_eq!(first.items.len(), 1);

    // Alice is excluded from the image while holding it ...
    assert!(engine.lease_batch("alice", 5, 0.5).unwrap().is_empty());

    // ... and after deciding it.
    let item = &first.items[0];
    engine
        .record_decision(item.review_id, "alice", first.id, &"no".into(), VERSION)
        .unwrap();
    assert!(engine.lease_batch("alice", 5, 0.5).unwrap().is_empty());

    let other = engine.lease_batch("bob", 5, 0.5).unwrap();
    assert_eq!(other.items.len(), 1);
    assert_eq!(other.items[0].image_id, item.image_id);
    assert_ne!(other.items[0].review_id, item.review_id);
}

#[test]
fn anti_affinity_survives_release_and_relet() {
    let mut engine = test_engine();
    let image = register(&mut engine, "Q1", "000", true);

    let first = engine.lease_batch("alice", 5, 0.5).unwrap();
    assert_eq!(first.items.len(), 1);
    assert_eq!(engine.release_lease("alice", first.id).unwrap().released, 1);

    let bob = engine.lease_batch("bob", 5, 0.5).unwrap();
    assert_eq!(bob.items.len(), 1);
    assert_eq!(bob.items[0].image_id, image);

    let again = engine.lease_batch("alice", 5, 0.5).unwrap();
    assert_eq!(again.items.len(), 1);
    assert_eq!(again.items[0].image_id, image);
    assert_ne!(again.items[0].review_id, bob.items[0].review_id);

    // While alice holds one copy, nothing more of Q1 is leased to alice.
    assert!(engine.lease_batch("alice", 5, 0.5).unwrap().is_empty());

    let held_by_alice = engine
        .storage()
        .reviews_for_image(image)
        .unwrap()
        .into_iter()
        .filter(|r| r.assigned_to.as_deref() == Some("alice"))
        .count();
    assert_eq!(held_by_alice, 1);
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

#[test]
fn release_returns_unfinished_rows_to_the_pool() {
    let mut engine = test_engine();
    for variant in ["000", "001", "002"] {
        register(&mut engine, "D1", variant, false);
    }

    let lease = engine.lease_batch("alice", 3, 0.0).unwrap();
    let decided = item_for(&lease.items, "000").review_id;
    engine
        .record_decision(decided, "alice", lease.id, &"no".into(), VERSION)
        .unwrap();

    let outcome = engine.release_lease("alice", lease.id).unwrap();
    assert_eq!(outcome.released, 2);
    assert_eq!(engine.review(decided).unwrap().status, ReviewStatus::Done);

    let again = engine.release_lease("alice", lease.id).unwrap();
    assert_eq!(again.released, 0);

    let relet = engine.lease_batch("bob", 3, 0.0).unwrap();
    let mut relet_ids: Vec<_> = relet.items.iter().map(|i| i.review_id).collect();
    relet_ids.sort();
    let mut released_ids: Vec<_> = lease
        .items
        .iter()
        .map(|i| i.review_id)
        .filter(|id| *id != decided)
        .collect();
    released_ids.sort();
    assert_eq!(relet_ids, released_ids);
}

#[test]
fn release_by_another_worker_touches_nothing() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "000", false);
    let lease = engine.lease_batch("alice", 1, 0.0).unwrap();

    assert_eq!(engine.release_lease("bob", lease.id).unwrap().released, 0);
    let review = engine.review(lease.items[0].review_id).unwrap();
    assert_eq!(review.assigned_to.as_deref(), Some("alice"));
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[test]
fn decision_is_recorded_under_matching_lease() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "000", false);
    register(&mut engine, "D1", "001", false);
    let lease = engine.lease_batch("alice", 2, 0.0).unwrap();
    let item = item_for(&lease.items, "000");

    let decision = engine
        .record_decision(item.review_id, "alice", lease.id, &"no".into(), "v2.3")
        .unwrap();
    assert_eq!(decision.outcome, RecordOutcome::Recorded);
    assert!(matches!(decision.finalization, FinalizationReport::NoRuleFired));

    let review = engine.review(item.review_id).unwrap();
    assert_eq!(review.status, ReviewStatus::Done);
    assert_eq!(review.result, Some(ResultLabel::new("no")));
    assert_eq!(review.standard_version.as_deref(), Some("v2.3"));
    assert!(review.decided_at.is_some());
}

#[test]
fn stale_decisions_write_nothing() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "000", false);
    let lease = engine.lease_batch("alice", 1, 0.0).unwrap();
    let review_id = lease.items[0].review_id;

    let wrong_lease = engine
        .record_decision(review_id, "alice", LeaseId::new(), &"no".into(), VERSION)
        .unwrap();
    assert_eq!(wrong_lease.outcome, RecordOutcome::Stale);
    assert!(matches!(wrong_lease.finalization, FinalizationReport::NotEvaluated));

    let wrong_worker = engine
        .record_decision(review_id, "bob", lease.id, &"no".into(), VERSION)
        .unwrap();
    assert!(!wrong_worker.is_recorded());

    engine.release_lease("alice", lease.id).unwrap();
    let after_release = engine
        .record_decision(review_id, "alice", lease.id, &"no".into(), VERSION)
        .unwrap();
    assert_eq!(after_release.outcome, RecordOutcome::Stale);

    let review = engine.review(review_id).unwrap();
    assert_eq!(review.status, ReviewStatus::Unassigned);
    assert_eq!(review.result, None);
}

#[test]
fn repeated_decision_is_stale() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "000", false);
    register(&mut engine, "D1", "001", false);
    let lease = engine.lease_batch("alice", 2, 0.0).unwrap();
    let review_id = item_for(&lease.items, "000").review_id;

    let first = engine
        .record_decision(review_id, "alice", lease.id, &"no".into(), VERSION)
        .unwrap();
    assert!(first.is_recorded());
    let second = engine
        .record_decision(review_id, "alice", lease.id, &"skip".into(), VERSION)
        .unwrap();
    assert_eq!(second.outcome, RecordOutcome::Stale);
    assert_eq!(
        engine.review(review_id).unwrap().result,
        Some(ResultLabel::new("no"))
    );
}

#[test]
fn labels_outside_the_allow_list_are_rejected() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "000", false);
    let lease = engine.lease_batch("alice", 1, 0.0).unwrap();
    let review_id = lease.items[0].review_id;

    for label in ["maybe", "auto_skip_device_yes", ""] {
        assert!(matches!(
            engine.record_decision(review_id, "alice", lease.id, &label.into(), VERSION),
            Err(Error::UnknownLabel(_))
        ));
    }
    assert_eq!(
        engine.review(review_id).unwrap().status,
        ReviewStatus::InProgress
    );
}

// ---------------------------------------------------------------------------
// Device rules
// ---------------------------------------------------------------------------

#[test]
fn yes_closes_every_remaining_review_of_the_device() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "000", false);
    let trigger_image = register(&mut engine, "D1", "001", false);
    register(&mut engine, "D1", "002", true);
    register(&mut engine, "D2", "000", false);

    let lease = engine.lease_batch("alice", 5, 0.0).unwrap();
    assert_eq!(lease.items.len(), 4);
    let trigger = lease
        .items
        .iter()
        .find(|i| i.image_id == trigger_image)
        .expect("trigger image leased");

    let decision = engine
        .record_decision(trigger.review_id, "alice", lease.id, &"yes".into(), VERSION)
        .unwrap();
    let FinalizationReport::Fired(fired) = decision.finalization else {
        panic!("expected the yes rule to fire");
    };
    assert_eq!(fired.rule, Rule::DeviceYes);
    assert_eq!(fired.device_id, "D1");
    assert_eq!(fired.closed_reviews, 3);
    assert!(fired.verdict_written);

    let history = engine.device_history("D1").unwrap();
    assert_eq!(history.len(), 4);
    let originals: Vec<_> = history.iter().filter(|(_, r)| r.synthetic().is_none()).collect();
    assert_eq!(originals, [&("001".to_string(), ResultLabel::new("yes"))]);

    let device = engine.device("D1").unwrap();
    assert_eq!(device.final_result, Some(DeviceVerdict::Yes));
    assert_eq!(device.decision_source, Some(trigger_image.to_string()));

    assert!(!engine.device("D2").unwrap().is_closed());
}

#[test]
fn yes_closes_reviews_leased_to_other_workers() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "000", false);
    register(&mut engine, "D1", "001", false);

    let alice = engine.lease_batch("alice", 1, 0.0).unwrap();
    let bob = engine.lease_batch("bob", 1, 0.0).unwrap();
    let bobs_review = bob.items[0].review_id;

    engine
        .record_decision(alice.items[0].review_id, "alice", alice.id, &"yes".into(), VERSION)
        .unwrap();

    let closed = engine.review(bobs_review).unwrap();
    assert_eq!(closed.status, ReviewStatus::Done);
    assert_eq!(closed.result, Some(SyntheticCode::AutoSkipDeviceYes.into()));
    // Existing stamps are preserved.
    assert_eq!(closed.assigned_to.as_deref(), Some("bob"));
    assert_eq!(closed.lease_id, Some(bob.id));

    let late = engine
        .record_decision(bobs_review, "bob", bob.id, &"no".into(), VERSION)
        .unwrap();
    assert_eq!(late.outcome, RecordOutcome::Stale);
    assert_eq!(engine.release_lease("bob", bob.id).unwrap().released, 0);
}

#[test]
fn no_skip_skip_closes_the_device_as_no() {
    let mut engine = test_engine();
    for variant in ["000", "001", "002", "003"] {
        register(&mut engine, "D1", variant, false);
    }
    let lease = engine.lease_batch("alice", 4, 0.0).unwrap();

    for (variant, label) in [("000", "no"), ("001", "skip")] {
        let d = engine
            .record_decision(item_for(&lease.items, variant).review_id, "alice", lease.id, &label.into(), VERSION)
            .unwrap();
        assert!(matches!(d.finalization, FinalizationReport::NoRuleFired));
    }

    let last = engine
        .record_decision(item_for(&lease.items, "002").review_id, "alice", lease.id, &"skip".into(), VERSION)
        .unwrap();
    let FinalizationReport::Fired(fired) = last.finalization else {
        panic!("expected the pattern rule to fire");
    };
    assert_eq!(fired.rule, Rule::RepeatedSkipPattern);
    assert_eq!(fired.closed_reviews, 1);

    let remaining = engine.review(item_for(&lease.items, "003").review_id).unwrap();
    assert_eq!(remaining.result, Some(SyntheticCode::RepeatedSkipPattern.into()));

    let device = engine.device("D1").unwrap();
    assert_eq!(device.final_result, Some(DeviceVerdict::No));
    assert_eq!(device.decision_source.as_deref(), Some("repeated_skip_rule"));
    assert_eq!(device.notes.as_deref(), Some("triggered_by: repeated_skip_pattern"));
}

#[test]
fn pattern_follows_variant_order_not_decision_order() {
    let mut engine = test_engine();
    for variant in ["000", "001", "002", "003"] {
        register(&mut engine, "D1", variant, false);
    }
    let lease = engine.lease_batch("alice", 4, 0.0).unwrap();

    // Decided out of order; in variant order the history reads no, skip, skip.
    for (variant, label) in [("002", "skip"), ("000", "no")] {
        engine
            .record_decision(item_for(&lease.items, variant).review_id, "alice", lease.id, &label.into(), VERSION)
            .unwrap();
    }
    let last = engine
        .record_decision(item_for(&lease.items, "001").review_id, "alice", lease.id, &"skip".into(), VERSION)
        .unwrap();
    assert!(matches!(last.finalization, FinalizationReport::Fired(_)));
}

#[test]
fn mismatched_pattern_leaves_the_device_open() {
    let mut engine = test_engine();
    for variant in ["000", "001", "002", "003"] {
        register(&mut engine, "D1", variant, false);
    }
    let lease = engine.lease_batch("alice", 4, 0.0).unwrap();

    for (variant, label) in [("000", "skip"), ("001", "skip"), ("002", "no")] {
        let d = engine
            .record_decision(item_for(&lease.items, variant).review_id, "alice", lease.id, &label.into(), VERSION)
            .unwrap();
        assert!(matches!(d.finalization, FinalizationReport::NoRuleFired));
    }
    assert!(!engine.device("D1").unwrap().is_closed());
    assert_eq!(
        engine.review(item_for(&lease.items, "003").review_id).unwrap().status,
        ReviewStatus::InProgress
    );
}

#[test]
fn closed_device_verdict_is_never_replaced() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "000", true);

    let alice = engine.lease_batch("alice", 1, 0.0).unwrap();
    let bob = engine.lease_batch("bob", 1, 0.0).unwrap();
    assert_eq!(alice.items.len(), 1);
    assert_eq!(bob.items.len(), 1);

    // Alice's yes closes Bob's QC copy; nothing Bob does can change the verdict.
    engine
        .record_decision(alice.items[0].review_id, "alice", alice.id, &"yes".into(), VERSION)
        .unwrap();
    let stale = engine
        .record_decision(bob.items[0].review_id, "bob", bob.id, &"yes".into(), VERSION)
        .unwrap();
    assert_eq!(stale.outcome, RecordOutcome::Stale);
    assert!(engine.finalize_exhausted_devices().unwrap().is_empty());

    let device = engine.device("D1").unwrap();
    assert_eq!(device.final_result, Some(DeviceVerdict::Yes));
    assert_eq!(device.notes.as_deref(), Some("triggered_by: yes_decision"));
}

#[test]
fn failed_finalization_keeps_the_decision() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reviews.db");
    let mut engine = Engine::open(&path, EngineOptions::default()).unwrap();
    register(&mut engine, "D1", "000", false);
    register(&mut engine, "D1", "001", false);
    let lease = engine.lease_batch("alice", 2, 0.0).unwrap();

    // Any verdict write on devices now aborts.
    let other = rusqlite::Connection::open(&path).unwrap();
    other
        .execute_batch(
            "CREATE TRIGGER reject_verdicts BEFORE UPDATE ON devices
             BEGIN SELECT RAISE(ABORT, 'verdicts locked'); END;",
        )
        .unwrap();
    drop(other);

    let trigger = item_for(&lease.items, "000").review_id;
    let decision = engine
        .record_decision(trigger, "alice", lease.id, &"yes".into(), VERSION)
        .unwrap();
    assert_eq!(decision.outcome, RecordOutcome::Recorded);
    assert!(matches!(decision.finalization, FinalizationReport::Failed(_)));

    let recorded = engine.review(trigger).unwrap();
    assert_eq!(recorded.status, ReviewStatus::Done);
    assert_eq!(recorded.result, Some(ResultLabel::new("yes")));

    // The bulk close rolled back together with the verdict write.
    let sibling = engine.review(item_for(&lease.items, "001").review_id).unwrap();
    assert_eq!(sibling.status, ReviewStatus::InProgress);
    assert_eq!(sibling.result, None);
    assert!(!engine.device("D1").unwrap().is_closed());
}

// ---------------------------------------------------------------------------
// Exhaustion sweep
// ---------------------------------------------------------------------------

#[test]
fn exhausted_devices_close_as_unknown() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "000", false);
    register(&mut engine, "D2", "000", false);

    let lease = engine.lease_batch("alice", 1, 0.0).unwrap();
    let device = lease.items[0].device_id.clone();
    engine
        .record_decision(lease.items[0].review_id, "alice", lease.id, &"no".into(), VERSION)
        .unwrap();

    let closed = engine.finalize_exhausted_devices().unwrap();
    assert_eq!(closed, [device.clone()]);

    let verdict = engine.device(&device).unwrap();
    assert_eq!(verdict.final_result, Some(DeviceVerdict::Unknown));
    assert_eq!(verdict.decision_source.as_deref(), Some(EXHAUSTED_SOURCE));

    // The other device still has open work.
    let other = if device == "D1" { "D2" } else { "D1" };
    assert!(!engine.device(other).unwrap().is_closed());
    assert!(engine.finalize_exhausted_devices().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Annotations and lookups
// ---------------------------------------------------------------------------

#[test]
fn annotations_are_stored_and_validated() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "000", false);
    let lease = engine.lease_batch("alice", 1, 0.0).unwrap();
    let review_id = lease.items[0].review_id;

    engine.add_annotation(review_id, 0.25, 0.75, MouseButton::Left).unwrap();
    engine.add_annotation(review_id, 1.0, 0.0, MouseButton::Right).unwrap();
    assert!(matches!(
        engine.add_annotation(review_id, 1.2, 0.5, MouseButton::Left),
        Err(Error::InvalidArgument(_))
    ));
    assert!(engine.add_annotation(ReviewId(9999), 0.5, 0.5, MouseButton::Left).is_err());

    let stored = engine.storage().annotations_for(review_id).unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].button, MouseButton::Left);
    assert_eq!(stored[0].x_norm, 0.25);
    assert_eq!(stored[1].button, MouseButton::Right);
}

#[test]
fn status_counts_track_transitions() {
    let mut engine = test_engine();
    register(&mut engine, "D1", "000", false);
    register(&mut engine, "D2", "000", true);
    engine.lease_batch("alice", 1, 1.0).unwrap();

    let counts = engine.storage().status_counts().unwrap();
    let count = |status| {
        counts
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };
    assert_eq!(count(ReviewStatus::Unassigned), 2);
    assert_eq!(count(ReviewStatus::InProgress), 1);
    assert_eq!(count(ReviewStatus::Done), 0);
}

#[test]
fn unknown_rows_are_not_found() {
    let engine = test_engine();
    assert!(matches!(engine.review(ReviewId(1)), Err(Error::NotFound(_))));
    assert!(matches!(engine.device("nope"), Err(Error::NotFound(_))));
}
