pub mod lock_manager;
pub mod transaction;
pub mod wal;

pub use lock_manager::{LockManager, LockMode};
pub use transaction::{Transaction, TransactionError, TransactionManager, TransactionState};
pub use wal::{LogManager, LogRecord, LogRecordType};
