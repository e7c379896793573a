//! The bitmap index: one `IndexEntry` per bitmap content block, packed the
//! way `dm-space-map-disk.c`'s `struct index_entry` is (`__le64 blocknr;
//! __le32 nr_free; __le32 none_free_before;`, 16 bytes, no padding).
//!
//! This implementation keeps the index block itself fixed for the space
//! map's lifetime (updated in place, not shadowed) — see `disk.rs`'s
//! module documentation for why.

use block_cache::{StandardValidator, Validator};
use byteorder::{ByteOrder, LittleEndian as LE};
use std::sync::Arc;

pub const ENTRY_SIZE: usize = 16;
/// `blocknr` (8) + `csum` (4), padded to 16 so entries stay 8-byte
/// aligned within the block.
pub const HEADER_SIZE: usize = 16;
pub const BLOCKNR_OFFSET: usize = 0;
pub const CSUM_OFFSET: usize = 8;

pub fn validator() -> Arc<dyn Validator> {
    Arc::new(StandardValidator::new(BLOCKNR_OFFSET, CSUM_OFFSET))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub blocknr: u64,
    pub nr_free: u32,
    pub none_free_before: u32,
}

pub fn capacity(block_size: usize) -> usize {
    (block_size - HEADER_SIZE) / ENTRY_SIZE
}

pub fn read_entry(buf: &[u8], i: usize) -> IndexEntry {
    let off = HEADER_SIZE + i * ENTRY_SIZE;
    IndexEntry {
        blocknr: LE::read_u64(&buf[off..off + 8]),
        nr_free: LE::read_u32(&buf[off + 8..off + 12]),
        none_free_before: LE::read_u32(&buf[off + 12..off + 16]),
    }
}

pub fn write_entry(buf: &mut [u8], i: usize, entry: &IndexEntry) {
    let off = HEADER_SIZE + i * ENTRY_SIZE;
    LE::write_u64(&mut buf[off..off + 8], entry.blocknr);
    LE::write_u32(&mut buf[off + 8..off + 12], entry.nr_free);
    LE::write_u32(&mut buf[off + 12..off + 16], entry.none_free_before);
}
