use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::PageId;

// The header page (page id 0) is a flat directory mapping index names to
// root page ids, updated on every root change.
//   0..4                record_count (u32)
//   4 + i * RECORD_SIZE name (32 bytes, zero padded) + root_page_id (i32)
const NAME_LEN: usize = 32;
const RECORD_SIZE: usize = NAME_LEN + 4;
const RECORDS_OFFSET: usize = 4;

fn record_count(data: &[u8]) -> usize {
    LittleEndian::read_u32(&data[0..4]) as usize
}

fn name_at(data: &[u8], index: usize) -> &[u8] {
    let at = RECORDS_OFFSET + index * RECORD_SIZE;
    &data[at..at + NAME_LEN]
}

fn find_record(data: &[u8], name: &str) -> Option<usize> {
    let padded = pad_name(name);
    (0..record_count(data)).find(|&i| name_at(data, i) == padded.as_slice())
}

fn pad_name(name: &str) -> [u8; NAME_LEN] {
    let mut padded = [0u8; NAME_LEN];
    let bytes = name.as_bytes();
    let len = bytes.len().min(NAME_LEN);
    padded[..len].copy_from_slice(&bytes[..len]);
    padded
}

/// Append a `(name, root_page_id)` record; fails if the name exists.
pub fn insert_record(data: &mut [u8], name: &str, root_page_id: PageId) -> bool {
    if find_record(data, name).is_some() {
        return false;
    }
    let count = record_count(data);
    let at = RECORDS_OFFSET + count * RECORD_SIZE;
    if at + RECORD_SIZE > data.len() {
        return false;
    }
    data[at..at + NAME_LEN].copy_from_slice(&pad_name(name));
    LittleEndian::write_i32(&mut data[at + NAME_LEN..at + RECORD_SIZE], root_page_id);
    LittleEndian::write_u32(&mut data[0..4], (count + 1) as u32);
    true
}

/// Overwrite the root id of an existing record.
pub fn update_record(data: &mut [u8], name: &str, root_page_id: PageId) -> bool {
    match find_record(data, name) {
        Some(index) => {
            let at = RECORDS_OFFSET + index * RECORD_SIZE + NAME_LEN;
            LittleEndian::write_i32(&mut data[at..at + 4], root_page_id);
            true
        }
        None => false,
    }
}

pub fn get_root_id(data: &[u8], name: &str) -> Option<PageId> {
    find_record(data, name).map(|index| {
        let at = RECORDS_OFFSET + index * RECORD_SIZE + NAME_LEN;
        LittleEndian::read_i32(&data[at..at + 4])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::PAGE_SIZE;

    #[test]
    fn test_insert_then_update() {
        let mut data = [0u8; PAGE_SIZE];
        assert!(insert_record(&mut data, "orders_pk", 3));
        assert!(insert_record(&mut data, "users_pk", 7));
        assert!(!insert_record(&mut data, "orders_pk", 9));

        assert_eq!(get_root_id(&data, "orders_pk"), Some(3));
        assert!(update_record(&mut data, "orders_pk", 11));
        assert_eq!(get_root_id(&data, "orders_pk"), Some(11));
        assert_eq!(get_root_id(&data, "users_pk"), Some(7));
    }

    #[test]
    fn test_missing_record() {
        let mut data = [0u8; PAGE_SIZE];
        assert_eq!(get_root_id(&data, "nope"), None);
        assert!(!update_record(&mut data, "nope", 1));
    }
}
