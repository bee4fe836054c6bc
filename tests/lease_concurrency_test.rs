//! Several worker processes sharing one store file, simulated with threads
//! that each open their own connection.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::thread;

use review_lease::engine::{Engine, EngineOptions};
use review_lease::model::*;

const WORKERS: usize = 6;

fn seed(path: &Path, devices: usize, qc_every: usize) {
    let mut engine = Engine::open(path, EngineOptions::default()).unwrap();
    for d in 0..devices {
        for variant in ["000", "001"] {
            let device = format!("D{d:03}");
            let qc = d % qc_every == 0;
            engine
                .register_image(
                    NewImage::new(
                        format!("share/{device}_{variant}.jpg"),
                        &device,
                        variant,
                        format!("{device}-{variant}"),
                    )
                    .qc(qc),
                )
                .unwrap();
        }
    }
}

#[test]
fn concurrent_leases_are_disjoint_and_respect_anti_affinity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reviews.db");
    seed(&path, 60, 4);

    let handles: Vec<_> = (0..WORKERS)
        .map(|w| {
            let path = path.clone();
            thread::spawn(move || {
                let worker = format!("worker-{w}");
                let mut engine = Engine::open(&path, EngineOptions::default()).unwrap();
                let mut leased = Vec::new();
                loop {
                    let lease = engine.lease_batch(&worker, 7, 0.10).unwrap();
                    if lease.is_empty() {
                        break;
                    }
                    leased.extend(lease.items);
                }
                (worker, leased)
            })
        })
        .collect();

    let results: Vec<(String, Vec<LeasedItem>)> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    let mut seen = HashSet::new();
    for (worker, items) in &results {
        let mut images = HashSet::new();
        for item in items {
            assert!(seen.insert(item.review_id), "review {} leased twice", item.review_id);
            assert!(
                images.insert(item.image_id),
                "{worker} holds two reviews of image {}",
                item.image_id
            );
        }
    }

    // 120 images, 15 devices with QC on both variants: 150 reviews in all.
    // Every row ends up leased unless the only workers left already hold
    // its QC twin, which cannot happen with more than one worker.
    assert_eq!(seen.len(), 150);

    let engine = Engine::open(&path, EngineOptions::default()).unwrap();
    for (worker, items) in &results {
        for item in items {
            let review = engine.review(item.review_id).unwrap();
            assert_eq!(review.status, ReviewStatus::InProgress);
            assert_eq!(review.assigned_to.as_deref(), Some(worker.as_str()));
        }
    }
}

#[test]
fn concurrent_decisions_close_every_device_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reviews.db");
    seed(&path, 30, 3);

    let handles: Vec<_> = (0..WORKERS)
        .map(|w| {
            let path = path.clone();
            thread::spawn(move || {
                let worker = format!("worker-{w}");
                let mut engine = Engine::open(&path, EngineOptions::default()).unwrap();
                let mut recorded = 0usize;
                loop {
                    let lease = engine.lease_batch(&worker, 4, 0.25).unwrap();
                    if lease.is_empty() {
                        break;
                    }
                    for item in &lease.items {
                        // Every device has a yes on its primary variant.
                        let label = if item.path.ends_with("_000.jpg") { "yes" } else { "no" };
                        let decision = engine
                            .record_decision(item.review_id, &worker, lease.id, &label.into(), "v1.0")
                            .unwrap();
                        if decision.is_recorded() {
                            recorded += 1;
                        }
                    }
                }
                engine.finalize_exhausted_devices().unwrap();
                recorded
            })
        })
        .collect();

    let recorded: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(recorded > 0);

    let engine = Engine::open(&path, EngineOptions::default()).unwrap();
    let counts: HashMap<ReviewStatus, u64> =
        engine.storage().status_counts().unwrap().into_iter().collect();
    assert_eq!(counts.get(&ReviewStatus::Unassigned), None);
    assert_eq!(counts.get(&ReviewStatus::InProgress), None);

    for d in 0..30 {
        let device = engine.device(&format!("D{d:03}")).unwrap();
        assert!(device.is_closed(), "device {} left open", device.id);
        let history = engine.device_history(&device.id).unwrap();
        let worker_labels = history.iter().filter(|(_, r)| r.synthetic().is_none()).count();
        assert!(worker_labels >= 1);
    }
}
