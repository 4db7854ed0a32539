use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::disk::DiskManagerError;
use crate::transaction::wal::LogManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("All frames are pinned")]
    PoolExhausted,

    #[error("Invalid page ID: {0}")]
    InvalidPage(PageId),

    #[error("Page {0} is not resident")]
    PageNotFound(PageId),

    #[error("Page {0} is not pinned")]
    PageNotPinned(PageId),

    #[error("Page {0} is pinned")]
    PagePinned(PageId),

    #[error("Disk manager error: {0}")]
    Disk(#[from] DiskManagerError),

    #[error("WAL error: {0}")]
    Wal(#[from] LogManagerError),
}
