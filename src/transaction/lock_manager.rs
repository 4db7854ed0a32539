use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::transaction::transaction::{Transaction, TransactionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    Upgrade,
}

struct EntryState {
    granted: bool,
    mode: LockMode,
}

/// One queued request. Each entry carries its own mutex and condvar so a
/// grant wakes exactly the intended waiter.
struct LockEntry {
    txn_id: TxnId,
    state: Mutex<EntryState>,
    granted_cv: Condvar,
}

impl LockEntry {
    fn new(txn_id: TxnId, granted: bool, mode: LockMode) -> Self {
        Self {
            txn_id,
            state: Mutex::new(EntryState { granted, mode }),
            granted_cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        while !state.granted {
            self.granted_cv.wait(&mut state);
        }
    }

    fn grant(&self) {
        let mut state = self.state.lock();
        state.granted = true;
        self.granted_cv.notify_one();
    }

    /// Grant an upgrade request; the entry leaves the wait as an exclusive
    /// holder.
    fn grant_as_exclusive(&self) {
        let mut state = self.state.lock();
        state.granted = true;
        state.mode = LockMode::Exclusive;
        self.granted_cv.notify_one();
    }

    fn mode(&self) -> LockMode {
        self.state.lock().mode
    }

    fn is_granted(&self) -> bool {
        self.state.lock().granted
    }
}

/// FIFO request queue for one RID
#[derive(Default)]
struct LockList {
    queue: Vec<Arc<LockEntry>>,
    is_upgrading: bool,
}

impl LockList {
    /// A request is immediately grantable when the queue is empty, or when
    /// it is a shared request arriving behind a granted shared tail.
    fn can_grant(&self, mode: LockMode) -> bool {
        match self.queue.last() {
            None => true,
            Some(tail) => {
                mode == LockMode::Shared && tail.is_granted() && tail.mode() == LockMode::Shared
            }
        }
    }
}

/// Tuple-granularity lock manager using wait-die for deadlock prevention:
/// a requester younger than the queue tail aborts instead of waiting.
/// With `strict_2pl`, unlocking before commit/abort aborts the transaction.
pub struct LockManager {
    strict_2pl: bool,
    table: Mutex<HashMap<Rid, Arc<Mutex<LockList>>>>,
}

impl LockManager {
    pub fn new(strict_2pl: bool) -> Self {
        Self {
            strict_2pl,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> bool {
        self.acquire(txn, rid, LockMode::Shared)
    }

    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> bool {
        self.acquire(txn, rid, LockMode::Exclusive)
    }

    /// Upgrade a granted shared lock to exclusive. Aborts if another upgrade
    /// is already queued on the RID, or if the transaction holds no granted
    /// shared lock there.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> bool {
        self.acquire(txn, rid, LockMode::Upgrade)
    }

    fn acquire(&self, txn: &Transaction, rid: Rid, mode: LockMode) -> bool {
        if txn.state() != TransactionState::Growing {
            txn.set_state(TransactionState::Aborted);
            return false;
        }

        // The table lock is held until the list lock is taken, so an unlock
        // emptying this list cannot orphan the entry we are about to queue.
        let mut table = self.table.lock();
        let list_arc = Arc::clone(table.entry(rid).or_default());
        let mut list = list_arc.lock();
        drop(table);

        if mode == LockMode::Upgrade {
            if list.is_upgrading {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
            let pos = list
                .queue
                .iter()
                .position(|e| e.txn_id == txn.id() && e.is_granted() && e.mode() == LockMode::Shared);
            match pos {
                Some(pos) => {
                    list.queue.remove(pos);
                    txn.remove_shared(rid);
                }
                None => {
                    txn.set_state(TransactionState::Aborted);
                    return false;
                }
            }
        }

        let can_grant = list.can_grant(mode);
        if !can_grant {
            // wait-die: only older transactions may wait on the tail
            let tail = list.queue.last().expect("non-grantable implies non-empty");
            if tail.txn_id < txn.id() {
                debug!(
                    "wait-die: txn {} dies waiting behind txn {} on {}",
                    txn.id(),
                    tail.txn_id,
                    rid
                );
                txn.set_state(TransactionState::Aborted);
                return false;
            }
        }

        // An immediately granted upgrade is stored as an exclusive hold
        let stored_mode = if mode == LockMode::Upgrade && can_grant {
            LockMode::Exclusive
        } else {
            mode
        };
        let entry = Arc::new(LockEntry::new(txn.id(), can_grant, stored_mode));
        list.queue.push(Arc::clone(&entry));

        if !can_grant {
            list.is_upgrading |= mode == LockMode::Upgrade;
            drop(list);
            entry.wait();
        }

        // An upgrade that waited was promoted to exclusive by the waker
        match entry.mode() {
            LockMode::Shared => txn.add_shared(rid),
            _ => txn.add_exclusive(rid),
        }
        true
    }

    /// Release `txn`'s lock on `rid` and wake whatever the head of the queue
    /// can now admit: one exclusive/upgrade waiter, or a run of shared
    /// waiters.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        let state = txn.state();
        if self.strict_2pl {
            if state != TransactionState::Committed && state != TransactionState::Aborted {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
        } else if state == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }

        let mut table = self.table.lock();
        let list_arc = match table.get(&rid) {
            Some(list_arc) => Arc::clone(list_arc),
            None => return false,
        };
        let mut list = list_arc.lock();

        let pos = match list.queue.iter().position(|e| e.txn_id == txn.id()) {
            Some(pos) => pos,
            None => return false,
        };
        let removed = list.queue.remove(pos);
        match removed.mode() {
            LockMode::Shared => txn.remove_shared(rid),
            _ => txn.remove_exclusive(rid),
        };

        if list.queue.is_empty() {
            table.remove(&rid);
            return true;
        }
        drop(table);

        let mut i = 0;
        while let Some(entry) = list.queue.get(i).map(Arc::clone) {
            if entry.is_granted() {
                break;
            }
            match entry.mode() {
                LockMode::Shared => {
                    entry.grant();
                    // keep admitting contiguous shared waiters
                    i += 1;
                }
                LockMode::Upgrade => {
                    list.is_upgrading = false;
                    entry.grant_as_exclusive();
                    break;
                }
                LockMode::Exclusive => {
                    entry.grant();
                    break;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new(false);
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);
        let rid = Rid::new(0, 0);

        assert!(lm.lock_shared(&t1, rid));
        assert!(lm.lock_shared(&t2, rid));
        assert!(t1.holds_shared(rid));
        assert!(t2.holds_shared(rid));
    }

    #[test]
    fn test_exclusive_excludes_younger() {
        let lm = LockManager::new(false);
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);
        let rid = Rid::new(0, 0);

        assert!(lm.lock_exclusive(&t1, rid));
        // t2 is younger than the holder, wait-die kills it
        assert!(!lm.lock_shared(&t2, rid));
        assert_eq!(t2.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_lock_after_growing_phase_aborts() {
        let lm = LockManager::new(false);
        let t1 = Transaction::new(1);
        let r1 = Rid::new(0, 0);
        let r2 = Rid::new(0, 1);

        assert!(lm.lock_shared(&t1, r1));
        assert!(lm.unlock(&t1, r1));
        assert_eq!(t1.state(), TransactionState::Shrinking);
        assert!(!lm.lock_shared(&t1, r2));
        assert_eq!(t1.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_upgrade_without_shared_aborts() {
        let lm = LockManager::new(false);
        let t1 = Transaction::new(1);
        let rid = Rid::new(0, 0);

        assert!(!lm.lock_upgrade(&t1, rid));
        assert_eq!(t1.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_upgrade_sole_holder() {
        let lm = LockManager::new(false);
        let t1 = Transaction::new(1);
        let rid = Rid::new(0, 0);

        assert!(lm.lock_shared(&t1, rid));
        assert!(lm.lock_upgrade(&t1, rid));
        assert!(t1.holds_exclusive(rid));
        assert!(!t1.holds_shared(rid));
    }

    #[test]
    fn test_strict_2pl_rejects_early_unlock() {
        let lm = LockManager::new(true);
        let t1 = Transaction::new(1);
        let rid = Rid::new(0, 0);

        assert!(lm.lock_exclusive(&t1, rid));
        assert!(!lm.unlock(&t1, rid));
        assert_eq!(t1.state(), TransactionState::Aborted);

        // once aborted, the unlock goes through
        assert!(lm.unlock(&t1, rid));
    }

    #[test]
    fn test_unlock_unknown_rid() {
        let lm = LockManager::new(false);
        let t1 = Transaction::new(1);
        assert!(!lm.unlock(&t1, Rid::new(9, 9)));
    }
}
