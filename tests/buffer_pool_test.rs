use std::sync::Arc;

use anyhow::Result;

use stratadb::storage::disk::DiskManager;
use stratadb::transaction::LogManager;
use stratadb::{BufferPoolError, BufferPoolManager};

mod common;
use common::{create_temp_db_file, create_test_buffer_pool};

#[test]
fn test_new_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let (page, page_id) = buffer_pool.new_page()?;
    assert_eq!(page_id, 0);
    {
        let guard = page.read();
        assert_eq!(guard.page_id, page_id);
        assert!(guard.data.iter().all(|&b| b == 0));
    }
    buffer_pool.unpin_page(page_id, false)?;
    Ok(())
}

#[test]
fn test_fetch_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let (_, page_id) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(page_id, false)?;

    let fetched = buffer_pool.fetch_page(page_id)?;
    {
        let guard = fetched.read();
        assert_eq!(guard.page_id, page_id);
    }
    buffer_pool.unpin_page(page_id, false)?;
    Ok(())
}

#[test]
fn test_victim_write_back() -> Result<()> {
    // Pool of two frames; the third page forces a dirty eviction.
    let (buffer_pool, _temp_file) = create_test_buffer_pool(2)?;

    let (p1_page, p1) = buffer_pool.new_page()?;
    {
        let mut guard = p1_page.write();
        guard.data[0] = b'A';
    }
    buffer_pool.unpin_page(p1, true)?;

    let (_, p2) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(p2, false)?;

    let (_, p3) = buffer_pool.new_page()?;

    let fetched = buffer_pool.fetch_page(p1)?;
    {
        let guard = fetched.read();
        assert_eq!(guard.data[0], b'A');
    }
    buffer_pool.unpin_page(p1, false)?;
    buffer_pool.unpin_page(p3, false)?;
    Ok(())
}

#[test]
fn test_pool_exhausted() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3)?;

    let mut pinned = Vec::new();
    for _ in 0..3 {
        let (_, page_id) = buffer_pool.new_page()?;
        pinned.push(page_id);
    }

    match buffer_pool.new_page() {
        Err(BufferPoolError::PoolExhausted) => {}
        other => panic!("expected PoolExhausted, got {:?}", other.map(|(_, id)| id)),
    }

    // Releasing one pin makes the pool usable again
    buffer_pool.unpin_page(pinned[0], false)?;
    let (_, page_id) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(page_id, false)?;
    for &page_id in &pinned[1..] {
        buffer_pool.unpin_page(page_id, false)?;
    }
    Ok(())
}

#[test]
fn test_unpin_errors() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(4)?;

    assert!(matches!(
        buffer_pool.unpin_page(42, false),
        Err(BufferPoolError::PageNotFound(42))
    ));

    let (_, page_id) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(page_id, false)?;
    assert!(matches!(
        buffer_pool.unpin_page(page_id, false),
        Err(BufferPoolError::PageNotPinned(_))
    ));
    Ok(())
}

#[test]
fn test_dirty_flag_is_sticky() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(4)?;

    let (page, page_id) = buffer_pool.new_page()?;
    {
        let mut guard = page.write();
        guard.data[10] = 7;
    }
    buffer_pool.unpin_page(page_id, true)?;

    // A later clean unpin must not wash out the dirty bit
    let _ = buffer_pool.fetch_page(page_id)?;
    buffer_pool.unpin_page(page_id, false)?;

    // Force eviction and re-read from disk
    let mut fill = Vec::new();
    for _ in 0..4 {
        let (_, id) = buffer_pool.new_page()?;
        fill.push(id);
    }
    for id in fill {
        buffer_pool.unpin_page(id, false)?;
    }

    let fetched = buffer_pool.fetch_page(page_id)?;
    assert_eq!(fetched.read().data[10], 7);
    buffer_pool.unpin_page(page_id, false)?;
    Ok(())
}

#[test]
fn test_delete_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(4)?;

    let (_, page_id) = buffer_pool.new_page()?;
    assert!(matches!(
        buffer_pool.delete_page(page_id),
        Err(BufferPoolError::PagePinned(_))
    ));

    buffer_pool.unpin_page(page_id, false)?;
    buffer_pool.delete_page(page_id)?;

    // The id is recycled by the disk manager
    let (_, reused) = buffer_pool.new_page()?;
    assert_eq!(reused, page_id);
    buffer_pool.unpin_page(reused, false)?;
    Ok(())
}

#[test]
fn test_flush_page_persists() -> Result<()> {
    let (file, path) = create_temp_db_file()?;
    let disk_manager = Arc::new(DiskManager::new(&path)?);
    let buffer_pool = Arc::new(BufferPoolManager::new(4, Arc::clone(&disk_manager), None));

    let (page, page_id) = buffer_pool.new_page()?;
    {
        let mut guard = page.write();
        guard.data[100] = b'X';
    }
    buffer_pool.unpin_page(page_id, true)?;
    buffer_pool.flush_page(page_id)?;

    // Bypass the pool and read the raw block
    let mut raw = [0u8; 4096];
    disk_manager.read_page(page_id, &mut raw)?;
    assert_eq!(raw[100], b'X');

    drop(file);
    Ok(())
}

#[test]
fn test_restart_round_trip() -> Result<()> {
    let (file, path) = create_temp_db_file()?;
    let page_id;
    {
        let disk_manager = Arc::new(DiskManager::new(&path)?);
        let buffer_pool = BufferPoolManager::new(4, disk_manager, None);
        let (page, id) = buffer_pool.new_page()?;
        page_id = id;
        page.write().data[0] = b'R';
        buffer_pool.unpin_page(id, true)?;
        buffer_pool.flush_all_pages()?;
    }
    {
        let disk_manager = Arc::new(DiskManager::new(&path)?);
        let buffer_pool = BufferPoolManager::new(4, disk_manager, None);
        let page = buffer_pool.fetch_page(page_id)?;
        assert_eq!(page.read().data[0], b'R');
        buffer_pool.unpin_page(page_id, false)?;
    }
    drop(file);
    Ok(())
}

#[test]
fn test_wal_flushed_before_dirty_write_back() -> Result<()> {
    let (_db_file, db_path) = create_temp_db_file()?;
    let (_log_file, log_path) = create_temp_db_file()?;

    let disk_manager = Arc::new(DiskManager::new(&db_path)?);
    let log_manager = Arc::new(LogManager::new(&log_path)?);
    let buffer_pool = BufferPoolManager::new(2, disk_manager, Some(Arc::clone(&log_manager)));

    let lsn = log_manager.append_record(1, 0, stratadb::transaction::LogRecordType::Begin)?;
    assert_eq!(log_manager.flushed_lsn(), 0);

    // Dirty a page, then force its eviction; the log must hit disk first.
    let (_, p1) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(p1, true)?;
    let (_, p2) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(p2, false)?;
    let (_, p3) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(p3, true)?;
    buffer_pool.fetch_page(p1)?;
    buffer_pool.unpin_page(p1, false)?;

    assert!(log_manager.flushed_lsn() >= lsn);
    Ok(())
}
