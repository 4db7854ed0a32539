use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::common::types::{Lsn, PageId, INVALID_PAGE_ID, PAGE_SIZE};

/// In-memory image of a disk page. The surrounding `RwLock` is the page
/// latch; pin count and dirty flag are frame metadata owned by the buffer
/// pool. Clients must never hold a latch on a page they have unpinned.
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
    pub lsn: Lsn,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
            lsn: 0,
        }
    }

    /// Zero the image and drop the identity, used when a frame is recycled.
    pub fn reset(&mut self) {
        self.data = [0; PAGE_SIZE];
        self.page_id = INVALID_PAGE_ID;
        self.lsn = 0;
    }
}

/// Smart pointer to a latchable page
pub type PagePtr = Arc<RwLock<Page>>;

/// Owned read guard; keeps the backing `PagePtr` alive so a traversal can
/// carry latches across function boundaries
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;

/// Owned write guard, see [`PageReadGuard`]
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

pub fn new_page_ptr() -> PagePtr {
    Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID)))
}
