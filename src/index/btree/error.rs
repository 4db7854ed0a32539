use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Page {page_id} is not a B+tree page (type tag {tag})")]
    InvalidPageFormat { page_id: PageId, tag: u32 },

    #[error("Buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),
}
