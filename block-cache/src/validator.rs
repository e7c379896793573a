use crate::error::{CacheError, Result};

/// Per-block-type hook invoked by the cache around every write and read.
///
/// `prepare_for_write` runs immediately before a dirty block is issued to
/// the device (it is the only place a block's self-address and checksum are
/// stamped). `check` runs after a read completes and fails the read if the
/// block doesn't look like what the caller asked for.
pub trait Validator: Send + Sync {
    fn prepare_for_write(&self, block: u64, data: &mut [u8]);
    fn check(&self, block: u64, data: &[u8]) -> Result<()>;
}

/// A validator that does nothing: used for blocks with no self-describing
/// header (the root/superblock block, or raw data blocks).
pub struct NullValidator;

impl Validator for NullValidator {
    fn prepare_for_write(&self, _block: u64, _data: &mut [u8]) {}
    fn check(&self, _block: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// The validator used for every self-describing node in this store: a
/// little-endian `u64` self-address at `blocknr_offset` and a CRC32C over
/// the whole block except the 4-byte checksum field itself, stored at
/// `csum_offset`.
///
/// This mirrors `dm_btree_node_check`/`node_prepare_for_write` in the
/// original `persistent-data` code: the checksum is computed over
/// everything in the block except its own field, so it can be verified
/// without first knowing whether it's valid.
pub struct StandardValidator {
    pub blocknr_offset: usize,
    pub csum_offset: usize,
}

impl StandardValidator {
    pub fn new(blocknr_offset: usize, csum_offset: usize) -> Self {
        Self { blocknr_offset, csum_offset }
    }

    fn checksum(&self, data: &[u8]) -> u32 {
        let before = &data[..self.csum_offset];
        let after = &data[self.csum_offset + 4..];
        let mut csum = crc32c::crc32c(before);
        csum = crc32c::crc32c_append(csum, after);
        csum
    }
}

impl Validator for StandardValidator {
    fn prepare_for_write(&self, block: u64, data: &mut [u8]) {
        data[self.blocknr_offset..self.blocknr_offset + 8].copy_from_slice(&block.to_le_bytes());
        let csum = self.checksum(data);
        data[self.csum_offset..self.csum_offset + 4].copy_from_slice(&csum.to_le_bytes());
    }

    fn check(&self, block: u64, data: &[u8]) -> Result<()> {
        let found = u64::from_le_bytes(
            data[self.blocknr_offset..self.blocknr_offset + 8].try_into().unwrap(),
        );
        if found != block {
            return Err(CacheError::SelfAddressMismatch { block, found });
        }
        let expected = u32::from_le_bytes(
            data[self.csum_offset..self.csum_offset + 4].try_into().unwrap(),
        );
        if self.checksum(data) != expected {
            return Err(CacheError::ChecksumMismatch { block });
        }
        Ok(())
    }
}
