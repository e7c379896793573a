//! Block 0 of the metadata device (spec.md section 6): magic, version,
//! device geometry, the monotonic allocator cursor, the forward and
//! reverse B-tree roots, and the space map's own persisted root.

use std::sync::Arc;

use block_cache::{StandardValidator, Validator};
use byteorder::{ByteOrder, LittleEndian as LE};

use persist_tree::space_map::disk::{SmRoot, SM_ROOT_SIZE};

pub const MAGIC: u64 = 21_081_990;
pub const VERSION: u64 = 1;

const MAGIC_OFF: usize = 0;
const VERSION_OFF: usize = 8;
const METADATA_BLOCK_SIZE_OFF: usize = 16;
const METADATA_NR_BLOCKS_OFF: usize = 24;
const DATA_BLOCK_SIZE_OFF: usize = 32;
const DATA_NR_BLOCKS_OFF: usize = 40;
const FIRST_FREE_BLOCK_OFF: usize = 48;
const FORWARD_ROOT_OFF: usize = 56;
const REVERSE_ROOT_OFF: usize = 64;
pub const SM_ROOT_OFFSET: usize = 72;
const SM_ROOT_OFF: usize = SM_ROOT_OFFSET;
pub const BLOCKNR_OFFSET: usize = SM_ROOT_OFF + SM_ROOT_SIZE;
pub const CSUM_OFFSET: usize = BLOCKNR_OFFSET + 8;
pub const HEADER_SIZE: usize = CSUM_OFFSET + 4;

pub fn validator() -> Arc<dyn Validator> {
    Arc::new(StandardValidator::new(BLOCKNR_OFFSET, CSUM_OFFSET))
}

#[derive(Clone, Copy, Debug)]
pub struct Superblock {
    pub metadata_block_size: u64,
    pub metadata_nr_blocks: u64,
    pub data_block_size: u64,
    pub data_nr_blocks: u64,
    pub first_free_block: u64,
    pub forward_root: u64,
    pub reverse_root: u64,
    pub sm_root: SmRoot,
}

impl Superblock {
    pub fn read(buf: &[u8]) -> Result<Self, &'static str> {
        if buf.len() < HEADER_SIZE {
            return Err("block too small for a superblock");
        }
        if LE::read_u64(&buf[MAGIC_OFF..MAGIC_OFF + 8]) != MAGIC {
            return Err("bad superblock magic");
        }
        if LE::read_u64(&buf[VERSION_OFF..VERSION_OFF + 8]) != VERSION {
            return Err("unsupported superblock version");
        }
        Ok(Self {
            metadata_block_size: LE::read_u64(&buf[METADATA_BLOCK_SIZE_OFF..METADATA_BLOCK_SIZE_OFF + 8]),
            metadata_nr_blocks: LE::read_u64(&buf[METADATA_NR_BLOCKS_OFF..METADATA_NR_BLOCKS_OFF + 8]),
            data_block_size: LE::read_u64(&buf[DATA_BLOCK_SIZE_OFF..DATA_BLOCK_SIZE_OFF + 8]),
            data_nr_blocks: LE::read_u64(&buf[DATA_NR_BLOCKS_OFF..DATA_NR_BLOCKS_OFF + 8]),
            first_free_block: LE::read_u64(&buf[FIRST_FREE_BLOCK_OFF..FIRST_FREE_BLOCK_OFF + 8]),
            forward_root: LE::read_u64(&buf[FORWARD_ROOT_OFF..FORWARD_ROOT_OFF + 8]),
            reverse_root: LE::read_u64(&buf[REVERSE_ROOT_OFF..REVERSE_ROOT_OFF + 8]),
            sm_root: SmRoot::read(&buf[SM_ROOT_OFF..SM_ROOT_OFF + SM_ROOT_SIZE]),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        LE::write_u64(&mut buf[MAGIC_OFF..MAGIC_OFF + 8], MAGIC);
        LE::write_u64(&mut buf[VERSION_OFF..VERSION_OFF + 8], VERSION);
        LE::write_u64(&mut buf[METADATA_BLOCK_SIZE_OFF..METADATA_BLOCK_SIZE_OFF + 8], self.metadata_block_size);
        LE::write_u64(&mut buf[METADATA_NR_BLOCKS_OFF..METADATA_NR_BLOCKS_OFF + 8], self.metadata_nr_blocks);
        LE::write_u64(&mut buf[DATA_BLOCK_SIZE_OFF..DATA_BLOCK_SIZE_OFF + 8], self.data_block_size);
        LE::write_u64(&mut buf[DATA_NR_BLOCKS_OFF..DATA_NR_BLOCKS_OFF + 8], self.data_nr_blocks);
        LE::write_u64(&mut buf[FIRST_FREE_BLOCK_OFF..FIRST_FREE_BLOCK_OFF + 8], self.first_free_block);
        LE::write_u64(&mut buf[FORWARD_ROOT_OFF..FORWARD_ROOT_OFF + 8], self.forward_root);
        LE::write_u64(&mut buf[REVERSE_ROOT_OFF..REVERSE_ROOT_OFF + 8], self.reverse_root);
        self.sm_root.write(&mut buf[SM_ROOT_OFF..SM_ROOT_OFF + SM_ROOT_SIZE]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let sb = Superblock {
            metadata_block_size: 8,
            metadata_nr_blocks: 1024,
            data_block_size: 128,
            data_nr_blocks: 4096,
            first_free_block: 3,
            forward_root: 7,
            reverse_root: 9,
            sm_root: SmRoot { nr_blocks: 1024, nr_allocated: 3, bitmap_root: 1, ref_count_root: 2 },
        };
        let mut buf = vec![0u8; 128];
        sb.write(&mut buf);
        let back = Superblock::read(&buf).unwrap();
        assert_eq!(back.first_free_block, 3);
        assert_eq!(back.sm_root.ref_count_root, 2);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 128];
        assert!(Superblock::read(&buf).is_err());
    }
}
