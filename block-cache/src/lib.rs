//! Fixed-size page cache over a block device.
//!
//! This is the lowest layer of the store: it knows nothing about B-trees,
//! space maps, or transactions, only about handing out read-locked or
//! write-locked views of fixed-size blocks with an optional per-block-type
//! validator for self-addressing and checksums.

mod cache;
mod error;
mod handle;
mod lock;
mod storage;
mod validator;

pub use cache::{BlockCache, CacheOptions};
pub use error::{CacheError, Result};
pub use handle::{ReadHandle, WriteHandle};
pub use validator::{NullValidator, StandardValidator, Validator};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn opts() -> CacheOptions {
        CacheOptions { block_size: 4096, nr_blocks: 16, cache_size: 4 }
    }

    #[test]
    fn read_write_roundtrip() {
        let cache = BlockCache::create_anon(opts()).unwrap();
        {
            let mut w = cache.write_lock(3, Arc::new(NullValidator)).unwrap();
            w[0..4].copy_from_slice(b"abcd");
        }
        let r = cache.read_lock(3, Arc::new(NullValidator)).unwrap();
        assert_eq!(&r[0..4], b"abcd");
    }

    #[test]
    fn write_try_lock_conflicts_with_reader() {
        let cache = BlockCache::create_anon(opts()).unwrap();
        let _r = cache.read_lock(1, Arc::new(NullValidator)).unwrap();
        let err = cache.write_try_lock(1, Arc::new(NullValidator));
        assert!(matches!(err, Err(CacheError::WouldBlock { block: 1 })));
    }

    #[test]
    fn standard_validator_round_trips() {
        let cache = BlockCache::create_anon(opts()).unwrap();
        let validator: Arc<dyn Validator> = Arc::new(StandardValidator::new(0, 8));
        {
            let mut w = cache.write_lock_zero(5, validator.clone()).unwrap();
            w[12..16].copy_from_slice(&42u32.to_le_bytes());
        }
        let r = cache.read_lock(5, validator).unwrap();
        assert_eq!(u32::from_le_bytes(r[12..16].try_into().unwrap()), 42);
    }

    #[test]
    fn standard_validator_rejects_tamper() {
        let cache = BlockCache::create_anon(opts()).unwrap();
        let validator: Arc<dyn Validator> = Arc::new(StandardValidator::new(0, 8));
        {
            let mut w = cache.write_lock_zero(2, validator.clone()).unwrap();
            w[12..16].copy_from_slice(&7u32.to_le_bytes());
        }
        {
            // Corrupt the block without going through the validator.
            let lock_free_validator: Arc<dyn Validator> = Arc::new(NullValidator);
            let mut w = cache.write_lock(2, lock_free_validator).unwrap();
            w[12] ^= 0xff;
        }
        let err = cache.read_lock(2, validator);
        assert!(matches!(err, Err(CacheError::ChecksumMismatch { block: 2 })));
    }

    #[test]
    fn out_of_range_is_rejected() {
        let cache = BlockCache::create_anon(opts()).unwrap();
        let err = cache.read_lock(100, Arc::new(NullValidator));
        assert!(matches!(err, Err(CacheError::OutOfRange { .. })));
    }
}
