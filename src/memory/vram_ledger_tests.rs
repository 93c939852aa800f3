//! Tests for the VRAM ledger.

use super::*;
use rand::Rng;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

const GB: u64 = 1024 * 1024 * 1024;

fn id(s: &str) -> ModelId {
    ModelId::from(s)
}

#[test]
fn reserved_margin_larger_than_total_rejected() {
    assert!(matches!(
        VramLedger::new(GB, 2 * GB),
        Err(LedgerError::InvalidBudget { .. })
    ));
}

#[test]
fn reserve_commit_release_cycle() {
    let ledger = VramLedger::new(8 * GB, GB).unwrap();
    assert_eq!(ledger.capacity(), 7 * GB);

    let token = ledger.reserve(&id("m1"), 3 * GB, false).unwrap();
    assert_eq!(ledger.pending_bytes(), 3 * GB);
    assert_eq!(ledger.used_bytes(), 0);
    assert_eq!(ledger.available_bytes(), 4 * GB);

    ledger.commit(token).unwrap();
    assert_eq!(ledger.pending_bytes(), 0);
    assert_eq!(ledger.used_bytes(), 3 * GB);
    assert_eq!(ledger.allocation(&id("m1")), Some(3 * GB));

    assert_eq!(ledger.release(&id("m1")), Some(3 * GB));
    assert_eq!(ledger.used_bytes(), 0);
    assert_eq!(ledger.release(&id("m1")), None);
}

#[test]
fn rollback_returns_headroom() {
    let ledger = VramLedger::new(4 * GB, 0).unwrap();
    let token = ledger.reserve(&id("m"), 4 * GB, false).unwrap();
    assert!(ledger.reserve(&id("other"), 1, false).is_err());

    ledger.rollback(token).unwrap();
    assert_eq!(ledger.available_bytes(), 4 * GB);
    assert!(ledger.allocation(&id("m")).is_none());
}

#[test]
fn reserve_fails_fast_with_available_figure() {
    let ledger = VramLedger::new(8 * GB, GB).unwrap();
    ledger
        .commit(ledger.reserve(&id("a"), 5 * GB, false).unwrap())
        .unwrap();

    let err = ledger.reserve(&id("b"), 3 * GB, false).unwrap_err();
    assert_eq!(
        err,
        LedgerError::Insufficient {
            requested: 3 * GB,
            available: 2 * GB
        }
    );
}

#[test]
fn reserve_overflow_is_insufficient_not_panic() {
    let ledger = VramLedger::new(GB, 0).unwrap();
    ledger
        .commit(ledger.reserve(&id("a"), 1, false).unwrap())
        .unwrap();
    assert!(matches!(
        ledger.reserve(&id("b"), u64::MAX, false),
        Err(LedgerError::Insufficient { .. })
    ));
}

#[test]
fn stale_token_is_unknown() {
    let ledger = VramLedger::new(GB, 0).unwrap();
    let stale = ReservationToken {
        id: 99,
        model: id("m"),
        bytes: 10,
        predictive: false,
    };
    assert_eq!(ledger.commit(stale), Err(LedgerError::UnknownToken(99)));
    assert_eq!(ledger.pending_bytes(), 0);
}

#[test]
fn predictive_flag_and_promotion() {
    let ledger = VramLedger::new(GB, 0).unwrap();
    ledger
        .commit(ledger.reserve(&id("warm"), 10, true).unwrap())
        .unwrap();
    assert!(ledger.is_predictive(&id("warm")));
    assert!(ledger.promote(&id("warm")));
    assert!(!ledger.is_predictive(&id("warm")));
    assert!(!ledger.promote(&id("warm")));
}

#[test]
fn snapshot_reports_budget() {
    let ledger = VramLedger::new(8 * GB, GB).unwrap();
    ledger
        .commit(ledger.reserve(&id("a"), 2 * GB, false).unwrap())
        .unwrap();
    let _pending = ledger.reserve(&id("b"), GB, false).unwrap();

    let budget = ledger.snapshot();
    assert_eq!(budget.capacity(), 7 * GB);
    assert_eq!(budget.used_bytes, 2 * GB);
    assert_eq!(budget.pending_bytes, GB);
    assert_eq!(budget.available(), 4 * GB);
}

/// Randomized concurrent reserve/commit/rollback/release sequences never
/// push usage past `total - reserved`, observed continuously from a
/// separate thread.
#[test]
fn usage_never_exceeds_capacity_under_concurrency() {
    let ledger = Arc::new(VramLedger::new(8 * GB, GB).unwrap());
    let capacity = ledger.capacity();
    let done = Arc::new(AtomicBool::new(false));

    let watcher = {
        let ledger = ledger.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut samples = 0u64;
            loop {
                assert!(ledger.in_use_bytes() <= capacity);
                assert!(ledger.snapshot().used_bytes <= capacity);
                samples += 1;
                if done.load(Ordering::SeqCst) {
                    break;
                }
            }
            samples
        })
    };

    let workers: Vec<_> = (0..8)
        .map(|w| {
            let ledger = ledger.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut held: Vec<ModelId> = Vec::new();
                for i in 0..2_000 {
                    let model = ModelId::from(format!("w{}-m{}", w, i));
                    let size = rng.gen_range(1..=3 * GB);
                    match ledger.reserve(&model, size, rng.gen_bool(0.3)) {
                        Ok(token) => {
                            assert!(ledger.in_use_bytes() <= capacity);
                            if rng.gen_bool(0.7) {
                                ledger.commit(token).unwrap();
                                held.push(model);
                            } else {
                                ledger.rollback(token).unwrap();
                            }
                        }
                        Err(LedgerError::Insufficient { .. }) => {}
                        Err(e) => panic!("unexpected ledger error: {}", e),
                    }
                    if !held.is_empty() && rng.gen_bool(0.5) {
                        let victim = held.swap_remove(rng.gen_range(0..held.len()));
                        assert!(ledger.release(&victim).is_some());
                    }
                }
                for model in held {
                    ledger.release(&model);
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    assert!(watcher.join().unwrap() > 0);

    assert_eq!(ledger.in_use_bytes(), 0);
    assert_eq!(ledger.pending_bytes(), 0);
}
