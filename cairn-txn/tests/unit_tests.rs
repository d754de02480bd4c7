//! Lock manager concurrency tests + deadlock detection

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;

use cairn_core::{metrics::Metrics, Error, LockHolder, ResourceKey, SessionId, TransactionId};
use cairn_txn::{InFlightTable, KeyRouter, LockManager, TransactionState};

fn txn(id: u64) -> LockHolder {
    LockHolder::Transaction(TransactionId(id))
}

fn keys(names: &[&str]) -> Vec<ResourceKey> {
    names.iter().map(|n| ResourceKey::object("accounts", *n)).collect()
}

// ============================================================================
// Deadlock detection test
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_sets_in_any_order_never_deadlock() {
    let locks = Arc::new(LockManager::new(Duration::from_secs(5), Metrics::new()));
    let busy: Arc<Vec<AtomicBool>> = Arc::new((0..3).map(|_| AtomicBool::new(false)).collect());
    let completed = Arc::new(AtomicU64::new(0));
    let all = ["a", "b", "c"];

    let mut handles = Vec::new();
    for t in 0..8u64 {
        let locks = Arc::clone(&locks);
        let busy = Arc::clone(&busy);
        let completed = Arc::clone(&completed);
        handles.push(tokio::spawn(async move {
            for round in 0..25u64 {
                let holder = txn(t * 1000 + round);
                let mut wanted = all.to_vec();
                wanted.shuffle(&mut rand::thread_rng());
                wanted.truncate(2);
                let wanted_keys = keys(&wanted);

                match locks.acquire(&wanted_keys, holder, None).await {
                    Ok(_) => {
                        let slots: Vec<usize> = wanted
                            .iter()
                            .map(|w| all.iter().position(|a| a == w).unwrap())
                            .collect();
                        for &slot in &slots {
                            assert!(!busy[slot].swap(true, Ordering::SeqCst), "two holders on one key");
                        }
                        tokio::task::yield_now().await;
                        for &slot in &slots {
                            busy[slot].store(false, Ordering::SeqCst);
                        }
                        locks.release(holder);
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(Error::LockTimeout { .. }) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
        }));
    }

    // Timeout-based deadlock detection
    let joined = tokio::time::timeout(Duration::from_secs(30), async {
        for h in handles {
            h.await.unwrap();
        }
    })
    .await;
    assert!(joined.is_ok(), "lock acquisition deadlocked");
    assert_eq!(completed.load(Ordering::Relaxed), 8 * 25);
    assert!(locks.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_in_crossed_order_rolls_back_cleanly() {
    let locks = Arc::new(LockManager::new(Duration::from_millis(100), Metrics::new()));
    let session = LockHolder::Session(SessionId(1));

    // a session pins `b` and never lets go within the window
    locks.acquire(&keys(&["b"]), session, None).await.unwrap();

    let a_then_b = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move { locks.acquire(&keys(&["b", "a"]), txn(1), None).await })
    };
    let err = a_then_b.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));

    assert_eq!(locks.held_by(txn(1)), vec![]);
    assert_eq!(locks.held_by(session), keys(&["b"]));
}

// ============================================================================
// Parallelism
// ============================================================================

#[tokio::test]
async fn test_disjoint_sets_do_not_wait() {
    let locks = LockManager::new(Duration::from_secs(5), Metrics::new());
    locks.acquire(&keys(&["a", "b"]), txn(1), None).await.unwrap();

    let started = std::time::Instant::now();
    locks
        .acquire(&keys(&["c", "d"]), txn(2), Some(Duration::from_millis(20)))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(20));
    assert_eq!(locks.len(), 4);
}

#[tokio::test]
async fn test_collection_and_object_keys_are_distinct_resources() {
    let locks = LockManager::new(Duration::from_millis(50), Metrics::new());
    locks
        .acquire(&[ResourceKey::collection("accounts")], txn(1), None)
        .await
        .unwrap();
    locks.acquire(&keys(&["a"]), txn(2), None).await.unwrap();
    assert_eq!(
        locks.holder_of(&ResourceKey::collection("accounts")),
        Some(txn(1))
    );
}

// ============================================================================
// Coordinator bookkeeping
// ============================================================================

#[test]
fn test_in_flight_table_tracks_state_machine() {
    let table = InFlightTable::new();
    let id = TransactionId(42);
    table.register(id, &[]).unwrap();
    table.transition(id, TransactionState::Staged).unwrap();
    assert!(table.transition(id, TransactionState::Committed).is_err());
    table.transition(id, TransactionState::ReadyToCommit).unwrap();
    table.transition(id, TransactionState::Committed).unwrap();
    assert!(table.unresolved().is_empty());
    assert!(table.finish(id).is_some());
}

#[test]
fn test_router_spreads_keys() {
    let router = KeyRouter::new(3).unwrap();
    let keys: Vec<_> = (0..300)
        .map(|i| cairn_core::ObjectKey::new("orders", format!("order:{}", i)))
        .collect();
    let pieces = router.partition_keys(&keys);
    assert_eq!(pieces.len(), 3);
    assert_eq!(pieces.values().map(Vec::len).sum::<usize>(), 300);
}
