use serde::{Deserialize, Serialize};

use crate::common::types::{Lsn, TxnId};

/// Types of log records supported by the WAL hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecordType {
    /// Marks the beginning of a transaction
    Begin,
    /// Marks the successful completion of a transaction
    Commit,
    /// Marks the abortion/rollback of a transaction
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub record_type: LogRecordType,
}

impl LogRecord {
    pub fn new(lsn: Lsn, txn_id: TxnId, prev_lsn: Lsn, record_type: LogRecordType) -> Self {
        Self {
            lsn,
            txn_id,
            prev_lsn,
            record_type,
        }
    }
}
