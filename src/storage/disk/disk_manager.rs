use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{PageId, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

struct AllocState {
    /// High-water mark; the next never-used page id
    next_page_id: PageId,
    /// Deallocated ids, reused before the high-water mark grows
    free_pages: Vec<PageId>,
}

/// DiskManager maps page ids to fixed-size blocks of the database file and
/// hands out page ids. Deallocation bookkeeping is in-memory only; recovery
/// of the free list across restarts is not this layer's concern.
pub struct DiskManager {
    db_file: Mutex<File>,
    alloc: Mutex<AllocState>,
}

impl DiskManager {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        let next_page_id = (file.metadata()?.len() / PAGE_SIZE as u64) as PageId;

        Ok(Self {
            db_file: Mutex::new(file),
            alloc: Mutex::new(AllocState {
                next_page_id,
                free_pages: Vec::new(),
            }),
        })
    }

    /// Hand out a page id, preferring previously deallocated ones.
    pub fn allocate_page(&self) -> PageId {
        let mut alloc = self.alloc.lock();
        if let Some(page_id) = alloc.free_pages.pop() {
            return page_id;
        }
        let page_id = alloc.next_page_id;
        alloc.next_page_id += 1;
        page_id
    }

    /// Return a page id to the free list. The block itself is left in place;
    /// a later allocation reuses it.
    pub fn deallocate_page(&self, page_id: PageId) {
        let mut alloc = self.alloc.lock();
        debug_assert!(!alloc.free_pages.contains(&page_id), "double free of page {}", page_id);
        alloc.free_pages.push(page_id);
    }

    /// Read a page into `buf`. Reads past the end of the file yield a zeroed
    /// page, so freshly allocated pages need no explicit initialization.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }
        debug_assert_eq!(buf.len(), PAGE_SIZE);

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();
        let file_size = file.metadata()?.len();
        if offset >= file_size {
            buf.fill(0);
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Write a page at its offset, extending the file as needed.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }
        debug_assert_eq!(buf.len(), PAGE_SIZE);

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        file.flush()?;
        Ok(())
    }

    /// Number of page ids currently handed out and not returned.
    pub fn num_allocated_pages(&self) -> usize {
        let alloc = self.alloc.lock();
        alloc.next_page_id as usize - alloc.free_pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_allocate_reuses_freed_pages() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();

        let p0 = disk.allocate_page();
        let p1 = disk.allocate_page();
        assert_eq!(p0, 0);
        assert_eq!(p1, 1);
        assert_eq!(disk.num_allocated_pages(), 2);

        disk.deallocate_page(p1);
        assert_eq!(disk.num_allocated_pages(), 1);
        assert_eq!(disk.allocate_page(), p1);
    }

    #[test]
    fn test_write_read_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();

        let page_id = disk.allocate_page();
        let mut data = [0u8; PAGE_SIZE];
        data[0] = b'A';
        data[PAGE_SIZE - 1] = b'Z';
        disk.write_page(page_id, &data).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        disk.read_page(page_id, &mut out).unwrap();
        assert_eq!(out[0], b'A');
        assert_eq!(out[PAGE_SIZE - 1], b'Z');
    }

    #[test]
    fn test_read_past_eof_is_zeroed() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();

        let page_id = disk.allocate_page();
        let mut out = [1u8; PAGE_SIZE];
        disk.read_page(page_id, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_invalid_page_id_rejected() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        assert!(disk.read_page(-1, &mut buf).is_err());
        assert!(disk.write_page(-1, &buf).is_err());
    }
}
