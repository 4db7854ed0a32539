use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Rid, TxnId};
use crate::transaction::lock_manager::LockManager;
use crate::transaction::wal::{LogManager, LogManagerError, LogRecordType};

/// Two-phase-locking transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} is not active")]
    NotActive(TxnId),

    #[error("WAL error: {0}")]
    Wal(#[from] LogManagerError),
}

/// An active transaction. Smaller ids are older, which is what the lock
/// manager's wait-die rule compares. The lock sets are mutated by the lock
/// manager from whichever thread runs the transaction, hence the interior
/// mutability.
pub struct Transaction {
    id: TxnId,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn holds_shared(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    pub fn holds_exclusive(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    pub(crate) fn add_shared(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub(crate) fn add_exclusive(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_shared(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().remove(&rid)
    }

    pub(crate) fn remove_exclusive(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().remove(&rid)
    }

    fn held_rids(&self) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }
}

/// Hands out monotonic transaction ids and drives commit/abort, releasing
/// every lock a finished transaction still holds.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    log_manager: Option<Arc<LogManager>>,
    active: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, log_manager: Option<Arc<LogManager>>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            log_manager,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self) -> Result<Arc<Transaction>, TransactionError> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id));
        if let Some(log_manager) = &self.log_manager {
            log_manager.append_record(txn_id, 0, LogRecordType::Begin)?;
        }
        self.active.lock().insert(txn_id, Arc::clone(&txn));
        Ok(txn)
    }

    pub fn commit(&self, txn: &Transaction) -> Result<(), TransactionError> {
        match txn.state() {
            TransactionState::Growing | TransactionState::Shrinking => {}
            _ => return Err(TransactionError::NotActive(txn.id())),
        }
        txn.set_state(TransactionState::Committed);
        self.release_all_locks(txn);
        if let Some(log_manager) = &self.log_manager {
            log_manager.append_record(txn.id(), 0, LogRecordType::Commit)?;
            log_manager.flush()?;
        }
        self.active.lock().remove(&txn.id());
        Ok(())
    }

    pub fn abort(&self, txn: &Transaction) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Committed {
            return Err(TransactionError::NotActive(txn.id()));
        }
        txn.set_state(TransactionState::Aborted);
        self.release_all_locks(txn);
        if let Some(log_manager) = &self.log_manager {
            log_manager.append_record(txn.id(), 0, LogRecordType::Abort)?;
        }
        self.active.lock().remove(&txn.id());
        Ok(())
    }

    fn release_all_locks(&self, txn: &Transaction) {
        for rid in txn.held_rids() {
            self.lock_manager.unlock(txn, rid);
        }
    }
}
