use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Lsn, TxnId};
use crate::transaction::wal::log_record::{LogRecord, LogRecordType};

#[derive(Error, Debug)]
pub enum LogManagerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode log record: {0}")]
    Encode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, LogManagerError>;

/// Append-only log with an in-memory staging buffer. The buffer pool calls
/// [`LogManager::flush`] before writing any dirty page so the log always
/// reaches disk first; a buffer pool constructed without a log manager has
/// logging disabled.
pub struct LogManager {
    log_file: Mutex<File>,
    buffer: Mutex<Vec<u8>>,
    next_lsn: AtomicU64,
    flushed_lsn: AtomicU64,
}

impl LogManager {
    pub fn new(log_path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_path)?;

        Ok(Self {
            log_file: Mutex::new(file),
            buffer: Mutex::new(Vec::new()),
            next_lsn: AtomicU64::new(1),
            flushed_lsn: AtomicU64::new(0),
        })
    }

    /// Stage a record in the log buffer and return its LSN. The record is
    /// durable only after the next [`flush`](LogManager::flush).
    pub fn append_record(
        &self,
        txn_id: TxnId,
        prev_lsn: Lsn,
        record_type: LogRecordType,
    ) -> Result<Lsn> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let record = LogRecord::new(lsn, txn_id, prev_lsn, record_type);
        let encoded = bincode::serialize(&record)?;

        let mut buffer = self.buffer.lock();
        buffer.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        buffer.extend_from_slice(&encoded);
        Ok(lsn)
    }

    /// Write the staged records out and fsync. Safe to call with an empty
    /// buffer; the buffer pool calls this on every dirty write-back.
    pub fn flush(&self) -> Result<()> {
        let pending = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        let mut file = self.log_file.lock();
        file.write_all(&pending)?;
        file.sync_data()?;
        self.flushed_lsn
            .store(self.next_lsn.load(Ordering::SeqCst) - 1, Ordering::SeqCst);
        Ok(())
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_append_assigns_monotonic_lsns() {
        let file = NamedTempFile::new().unwrap();
        let log = LogManager::new(file.path()).unwrap();

        let a = log.append_record(1, 0, LogRecordType::Begin).unwrap();
        let b = log.append_record(1, a, LogRecordType::Commit).unwrap();
        assert!(b > a);
        assert_eq!(log.flushed_lsn(), 0);
    }

    #[test]
    fn test_flush_advances_flushed_lsn() {
        let file = NamedTempFile::new().unwrap();
        let log = LogManager::new(file.path()).unwrap();

        let a = log.append_record(3, 0, LogRecordType::Begin).unwrap();
        let b = log.append_record(3, a, LogRecordType::Abort).unwrap();
        log.flush().unwrap();
        assert_eq!(log.flushed_lsn(), b);

        // Flushing with nothing staged is a no-op
        log.flush().unwrap();
        assert_eq!(log.flushed_lsn(), b);
    }
}
