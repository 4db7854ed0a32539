use std::fmt;

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type; negative values are sentinels
pub type PageId = i32;

/// Buffer pool frame ID type
pub type FrameId = usize;

/// Transaction ID type; ids are handed out monotonically, smaller is older
pub type TxnId = u32;

/// Slot number within a page
pub type SlotId = u32;

/// LSN (Log Sequence Number) type
pub type Lsn = u64;

/// Sentinel for "no page"
pub const INVALID_PAGE_ID: PageId = -1;

/// Page id 0 is reserved for the index directory
pub const HEADER_PAGE_ID: PageId = 0;

/// Default capacity of each extendible-hash bucket
pub const BUCKET_SIZE: usize = 16;

/// Record identifier: a page and a slot within it. Acts as tuple identity
/// for the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: SlotId,
}

impl Rid {
    pub fn new(page_id: PageId, slot: SlotId) -> Self {
        Self { page_id, slot }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}
