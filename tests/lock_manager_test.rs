use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stratadb::common::types::Rid;
use stratadb::transaction::{LockManager, Transaction, TransactionState};

#[test]
fn test_wait_die_abort_and_grant() {
    // Scenario: T1 (older than T2) holds X on a rid. The younger T2 dies on
    // arrival; the older T3 waits and is granted once T1 unlocks.
    let lm = Arc::new(LockManager::new(false));
    let t1 = Arc::new(Transaction::new(2));
    let t2 = Arc::new(Transaction::new(3));
    let t3 = Arc::new(Transaction::new(1));
    let rid = Rid::new(1, 7);

    assert!(lm.lock_exclusive(&t1, rid));

    assert!(!lm.lock_shared(&t2, rid));
    assert_eq!(t2.state(), TransactionState::Aborted);

    let waiter = {
        let lm = Arc::clone(&lm);
        let t3 = Arc::clone(&t3);
        thread::spawn(move || lm.lock_shared(&t3, rid))
    };

    // Give the waiter time to enqueue behind T1
    thread::sleep(Duration::from_millis(50));
    assert!(lm.unlock(&t1, rid));

    assert!(waiter.join().unwrap());
    assert!(t3.holds_shared(rid));
    assert!(lm.unlock(&t3, rid));
}

#[test]
fn test_shared_waiters_wake_together() {
    let lm = Arc::new(LockManager::new(false));
    let writer = Arc::new(Transaction::new(5));
    let rid = Rid::new(2, 0);

    assert!(lm.lock_exclusive(&writer, rid));

    let mut readers = Vec::new();
    for id in (1..=3).rev() {
        let lm = Arc::clone(&lm);
        let txn = Arc::new(Transaction::new(id));
        let handle = {
            let txn = Arc::clone(&txn);
            thread::spawn(move || lm.lock_shared(&txn, rid))
        };
        readers.push((txn, handle));
        // Keep arrivals ordered so each next reader is older than the tail
        thread::sleep(Duration::from_millis(20));
    }

    assert!(lm.unlock(&writer, rid));
    for (txn, handle) in readers {
        assert!(handle.join().unwrap());
        assert!(txn.holds_shared(rid));
    }
}

#[test]
fn test_upgrade_waits_for_other_readers() {
    let lm = Arc::new(LockManager::new(false));
    let t1 = Arc::new(Transaction::new(1));
    let t2 = Arc::new(Transaction::new(2));
    let rid = Rid::new(3, 3);

    assert!(lm.lock_shared(&t2, rid));
    assert!(lm.lock_shared(&t1, rid));

    // T1 upgrades; it must wait until T2 drops its shared lock.
    let upgrader = {
        let lm = Arc::clone(&lm);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || lm.lock_upgrade(&t1, rid))
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!upgrader.is_finished());

    assert!(lm.unlock(&t2, rid));
    assert!(upgrader.join().unwrap());
    assert!(t1.holds_exclusive(rid));
}

#[test]
fn test_exclusive_waiter_blocks_until_unlock() {
    let lm = Arc::new(LockManager::new(false));
    let older = Arc::new(Transaction::new(1));
    let younger = Arc::new(Transaction::new(9));
    let rid = Rid::new(4, 4);

    assert!(lm.lock_shared(&younger, rid));

    let waiter = {
        let lm = Arc::clone(&lm);
        let older = Arc::clone(&older);
        thread::spawn(move || lm.lock_exclusive(&older, rid))
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    assert!(lm.unlock(&younger, rid));
    assert!(waiter.join().unwrap());
    assert!(older.holds_exclusive(rid));
}
