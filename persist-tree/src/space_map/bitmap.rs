//! 2-bit-per-slot bitmap content block: `0` free, `1`/`2` reference count,
//! `3` overflow (exact count kept in the ref-count B-tree). Matches the
//! bit layout `dm-space-map-disk.c`'s bitmap validator expects.

use block_cache::{StandardValidator, Validator};
use std::sync::Arc;

/// `blocknr` (8 bytes) + `csum` (4 bytes), then the packed bits.
pub const HEADER_SIZE: usize = 12;
pub const BLOCKNR_OFFSET: usize = 0;
pub const CSUM_OFFSET: usize = 8;

pub fn validator() -> Arc<dyn Validator> {
    Arc::new(StandardValidator::new(BLOCKNR_OFFSET, CSUM_OFFSET))
}

pub fn capacity(block_size: usize) -> usize {
    (block_size - HEADER_SIZE) * 4
}

pub fn get(buf: &[u8], slot: usize) -> u8 {
    let byte = HEADER_SIZE + slot / 4;
    let shift = (slot % 4) * 2;
    (buf[byte] >> shift) & 0b11
}

pub fn set(buf: &mut [u8], slot: usize, value: u8) {
    let byte = HEADER_SIZE + slot / 4;
    let shift = (slot % 4) * 2;
    buf[byte] = (buf[byte] & !(0b11 << shift)) | ((value & 0b11) << shift);
}
