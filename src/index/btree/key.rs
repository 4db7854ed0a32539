use std::fmt::Debug;

use byteorder::{ByteOrder, LittleEndian};

/// Fixed-width index key. The node layout stores keys inline, so every key
/// type declares its encoded width; comparison order is the type's `Ord`.
pub trait BTreeKey: Copy + Ord + Default + Debug + Send + Sync + 'static {
    const ENCODED_LEN: usize;

    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;

    /// Build a key from an integer, used by the file-driven test helpers.
    fn from_i64(value: i64) -> Self;
}

impl BTreeKey for i32 {
    const ENCODED_LEN: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i32(buf)
    }

    fn from_i64(value: i64) -> Self {
        value as i32
    }
}

impl BTreeKey for i64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i64(buf)
    }

    fn from_i64(value: i64) -> Self {
        value
    }
}

impl BTreeKey for u64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }

    fn from_i64(value: i64) -> Self {
        value as u64
    }
}
