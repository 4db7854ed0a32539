use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::common::types::{FrameId, PageId, BUCKET_SIZE, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::page_table::ExtendibleHashTable;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;
use crate::storage::page::{new_page_ptr, PagePtr};
use crate::transaction::wal::LogManager;

/// Per-frame bookkeeping. A frame is on the free list, in the replacer, or
/// pinned by at least one client, never more than one of those at a time.
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

struct PoolState {
    frames: Vec<FrameMeta>,
    free_list: VecDeque<FrameId>,
}

/// Fixed-capacity page cache. All public operations are serialized by one
/// coarse mutex; page bytes themselves are protected by the per-page latch
/// and only touched here when a frame is recycled or flushed, at which point
/// no well-behaved client holds the latch.
pub struct BufferPoolManager {
    pool_size: usize,
    pages: Vec<PagePtr>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: LruReplacer<FrameId>,
    state: Mutex<PoolState>,
    disk_manager: Arc<DiskManager>,
    log_manager: Option<Arc<LogManager>>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        assert!(pool_size > 0);
        let pages = (0..pool_size).map(|_| new_page_ptr()).collect();
        let frames = (0..pool_size)
            .map(|_| FrameMeta {
                page_id: INVALID_PAGE_ID,
                pin_count: 0,
                is_dirty: false,
            })
            .collect();

        Self {
            pool_size,
            pages,
            page_table: ExtendibleHashTable::new(BUCKET_SIZE),
            replacer: LruReplacer::new(),
            state: Mutex::new(PoolState {
                frames,
                free_list: (0..pool_size).collect(),
            }),
            disk_manager,
            log_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Pin the page, reading it from disk if it is not resident.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPage(page_id));
        }

        let mut state = self.state.lock();
        if let Some(frame_id) = self.page_table.find(&page_id) {
            state.frames[frame_id].pin_count += 1;
            self.replacer.erase(frame_id);
            return Ok(Arc::clone(&self.pages[frame_id]));
        }

        let frame_id = self.recycle_frame(&mut state)?;
        {
            let mut page = self.pages[frame_id].write();
            page.reset();
            page.page_id = page_id;
            if let Err(e) = self.disk_manager.read_page(page_id, &mut page.data) {
                // The recycled frame must not leak: return it to the free list.
                page.reset();
                drop(page);
                state.frames[frame_id] = FrameMeta {
                    page_id: INVALID_PAGE_ID,
                    pin_count: 0,
                    is_dirty: false,
                };
                state.free_list.push_back(frame_id);
                return Err(e.into());
            }
        }
        state.frames[frame_id] = FrameMeta {
            page_id,
            pin_count: 1,
            is_dirty: false,
        };
        self.page_table.insert(page_id, frame_id);
        Ok(Arc::clone(&self.pages[frame_id]))
    }

    /// Drop one pin. The dirty flag is sticky until write-back. When the pin
    /// count reaches zero the frame becomes a replacement candidate.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = self
            .page_table
            .find(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        let meta = &mut state.frames[frame_id];
        if meta.pin_count == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }
        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        if meta.pin_count == 0 {
            self.replacer.insert(frame_id);
        }
        Ok(())
    }

    /// Allocate a fresh disk page and pin a zeroed frame for it.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = self.recycle_frame(&mut state)?;
        let page_id = self.disk_manager.allocate_page();

        {
            let mut page = self.pages[frame_id].write();
            page.reset();
            page.page_id = page_id;
        }
        state.frames[frame_id] = FrameMeta {
            page_id,
            pin_count: 1,
            is_dirty: false,
        };
        self.page_table.insert(page_id, frame_id);
        Ok((Arc::clone(&self.pages[frame_id]), page_id))
    }

    /// Evict the page if resident and return its id to the disk manager.
    /// Fails if any client still pins it.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPage(page_id));
        }

        let mut state = self.state.lock();
        if let Some(frame_id) = self.page_table.find(&page_id) {
            if state.frames[frame_id].pin_count != 0 {
                return Err(BufferPoolError::PagePinned(page_id));
            }
            self.page_table.remove(&page_id);
            self.replacer.erase(frame_id);
            self.pages[frame_id].write().reset();
            state.frames[frame_id] = FrameMeta {
                page_id: INVALID_PAGE_ID,
                pin_count: 0,
                is_dirty: false,
            };
            state.free_list.push_back(frame_id);
        }
        self.disk_manager.deallocate_page(page_id);
        Ok(())
    }

    /// Write a resident page out, leaving it resident. The dirty flag is
    /// left as-is so eviction-time write-back stays order independent.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPage(page_id));
        }

        let _state = self.state.lock();
        let frame_id = self
            .page_table
            .find(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        if let Some(log_manager) = &self.log_manager {
            log_manager.flush()?;
        }
        let page = self.pages[frame_id].read();
        self.disk_manager.write_page(page_id, &page.data)?;
        Ok(())
    }

    /// Flush every resident page, e.g. on shutdown.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let state = self.state.lock();
        if let Some(log_manager) = &self.log_manager {
            log_manager.flush()?;
        }
        for (frame_id, meta) in state.frames.iter().enumerate() {
            if meta.page_id != INVALID_PAGE_ID {
                let page = self.pages[frame_id].read();
                self.disk_manager.write_page(meta.page_id, &page.data)?;
            }
        }
        Ok(())
    }

    /// Pick a frame to reuse: free list first, then the LRU victim. A dirty
    /// victim is written back, after the log flush hook when one is
    /// configured.
    fn recycle_frame(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = match self.replacer.victim() {
            Some(frame_id) => frame_id,
            None => {
                warn!("buffer pool exhausted: all {} frames pinned", self.pool_size);
                return Err(BufferPoolError::PoolExhausted);
            }
        };

        let old_page_id = state.frames[frame_id].page_id;
        let old_dirty = state.frames[frame_id].is_dirty;
        debug_assert_eq!(state.frames[frame_id].pin_count, 0);
        if old_page_id != INVALID_PAGE_ID {
            self.page_table.remove(&old_page_id);
            if old_dirty {
                debug!("evicting dirty page {} from frame {}", old_page_id, frame_id);
                if let Err(e) = self.write_back(frame_id, old_page_id) {
                    // Undo the eviction so the dirty page is not lost.
                    self.page_table.insert(old_page_id, frame_id);
                    self.replacer.insert(frame_id);
                    return Err(e);
                }
            }
        }
        Ok(frame_id)
    }

    fn write_back(&self, frame_id: FrameId, page_id: PageId) -> Result<(), BufferPoolError> {
        if let Some(log_manager) = &self.log_manager {
            log_manager.flush()?;
        }
        let page = self.pages[frame_id].read();
        self.disk_manager.write_page(page_id, &page.data)?;
        Ok(())
    }
}
