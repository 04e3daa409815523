//! Integration tests for transaction slots, resource locks and deadlock
//! detection across tasks.

use db_router::admission::{ConcurrencyManager, ConcurrencyOptions, RetryPolicy};
use db_router::error::DbError;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn manager(max_transactions: usize, slot_wait: Duration) -> ConcurrencyManager {
    ConcurrencyManager::new(ConcurrencyOptions {
        max_concurrent_transactions: max_transactions,
        lock_timeout: Duration::from_secs(30),
        slot_wait,
    })
}

#[tokio::test]
async fn test_disjoint_sets_both_succeed() {
    let manager = manager(10, Duration::from_secs(1));

    let first = manager
        .acquire("tx_1", ["account:1", "account:2"], None)
        .await
        .unwrap();
    let second = manager
        .acquire("tx_2", ["account:3", "account:4"], None)
        .await
        .unwrap();

    let stats = manager.stats();
    assert_eq!(stats.active_locks, 4);
    assert_eq!(stats.active_transactions, 2);
    assert_eq!(first.transaction_id(), "tx_1");
    assert_eq!(second.transaction_id(), "tx_2");
}

#[tokio::test]
async fn test_overlap_refused_until_release() {
    let manager = manager(10, Duration::from_secs(1));

    let first = manager
        .acquire("tx_1", ["account:1", "account:2"], None)
        .await
        .unwrap();

    let err = manager
        .acquire("tx_2", ["account:2", "account:3"], None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DbError::LockConflict { ref resource, ref holder }
            if resource == "account:2" && holder == "tx_1"
    ));
    assert!(err.is_rejection());
    assert_eq!(manager.holder("account:3"), None);

    assert!(first.release());
    let _second = manager
        .acquire("tx_2", ["account:2", "account:3"], None)
        .await
        .unwrap();
    assert_eq!(manager.holder("account:2").as_deref(), Some("tx_2"));
}

#[tokio::test]
async fn test_crossed_requests_report_deadlock() {
    let manager = manager(10, Duration::from_secs(1));

    let _t1 = manager.acquire("t1", ["A"], None).await.unwrap();
    let _t2 = manager.acquire("t2", ["B"], None).await.unwrap();

    // t1 now waits for B.
    let err = manager.acquire("t1", ["B"], None).await.unwrap_err();
    assert!(matches!(err, DbError::LockConflict { .. }));

    // t2 asking for A closes the cycle.
    let err = manager.acquire("t2", ["A"], None).await.unwrap_err();
    assert!(matches!(err, DbError::DeadlockDetected { .. }), "{err}");

    let stats = manager.stats();
    assert_eq!(stats.deadlocks_detected, 1);
    assert_eq!(stats.lock_conflicts, 1);
}

#[tokio::test]
async fn test_slot_waiter_admitted_after_release() {
    let manager = manager(1, Duration::from_secs(5));
    let holder = manager.acquire("tx_1", ["a"], None).await.unwrap();

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire("tx_2", ["b"], None).await.map(|g| g.release()) })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    drop(holder);
    assert!(waiter.await.unwrap().unwrap());
    assert_eq!(manager.stats().total_transactions, 2);
    assert_eq!(manager.stats().active_transactions, 0);
}

#[tokio::test]
async fn test_contended_resource_serializes_holders() {
    let manager = manager(16, Duration::from_secs(1));
    let inside = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let retry = RetryPolicy {
        max_attempts: 200,
        initial_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(10),
        multiplier: 1.5,
    };

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        let inside = Arc::clone(&inside);
        let completed = Arc::clone(&completed);
        handles.push(tokio::spawn(async move {
            let transaction_id = format!("tx_{i}");
            let guard = retry
                .run_if(
                    "lock inventory",
                    |e| matches!(e, DbError::LockConflict { .. }),
                    || manager.acquire(&transaction_id, ["inventory:7"], None),
                )
                .await
                .unwrap();

            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
            tokio::time::sleep(Duration::from_millis(5)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            completed.fetch_add(1, Ordering::SeqCst);
            drop(guard);
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 8);

    let stats = manager.stats();
    assert_eq!(stats.total_transactions, 8);
    assert_eq!(stats.active_locks, 0);
    assert!(stats.lock_conflicts > 0);
}

#[tokio::test(start_paused = true)]
async fn test_expiry_frees_slot_of_abandoned_transaction() {
    let manager = manager(1, Duration::from_millis(100));
    let abandoned = manager
        .acquire("tx_1", ["a"], Some(Duration::from_secs(2)))
        .await
        .unwrap();
    // Guard leaked; only expiry can reclaim the slot.
    std::mem::forget(abandoned);

    let err = manager.acquire("tx_2", ["b"], None).await.unwrap_err();
    assert!(matches!(err, DbError::ConcurrencyTimeout { .. }));

    tokio::time::advance(Duration::from_secs(3)).await;
    manager.clean_expired();
    assert!(!manager.is_registered("tx_1"));
    assert!(manager.acquire("tx_2", ["b"], None).await.is_ok());
}
