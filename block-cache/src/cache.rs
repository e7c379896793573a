use std::cell::UnsafeCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{CacheError, Result};
use crate::handle::{ReadHandle, WriteHandle};
use crate::lock::BlockLock;
use crate::storage::Storage;
use crate::validator::Validator;

/// Configuration for opening or creating a [`BlockCache`].
#[derive(Clone, Debug)]
pub struct CacheOptions {
    pub block_size: usize,
    pub nr_blocks: u64,
    /// Hint for how many blocks' worth of frames the cache should keep
    /// warm. This implementation backs the whole device with a single
    /// memory map, so the hint only affects `status()` reporting; eviction
    /// of cache frames under memory pressure is not implemented (the OS
    /// page cache does that for us).
    pub cache_size: usize,
}

/// Fixed-size page cache over a block device.
///
/// Unbounded concurrent readers XOR one writer is enforced per-block via
/// [`BlockLock`]. Dirty blocks are considered written back once their
/// write handle is dropped; [`BlockCache::flush_and_unlock`] is the only
/// operation that forces the data to stable storage and defines a barrier
/// ordering against the block passed to it (normally the superblock).
pub struct BlockCache {
    storage: UnsafeCell<Storage>,
    block_size: usize,
    nr_blocks: u64,
    cache_size: usize,
    locks: Mutex<HashMap<u64, Arc<BlockLock>>>,
    dirty: Mutex<HashSet<u64>>,
}

// Safety: all access to `storage`'s bytes is mediated by the per-block
// `BlockLock`s; resizing/rebinding the storage itself requires that no
// locks are outstanding, which is the caller's responsibility (documented
// on `rebind`).
unsafe impl Sync for BlockCache {}

impl BlockCache {
    pub fn create<P: AsRef<Path>>(path: P, opts: CacheOptions) -> Result<Self> {
        let storage = Storage::open(path, opts.block_size as u64 * opts.nr_blocks)?;
        Ok(Self::from_storage(storage, opts))
    }

    pub fn create_anon(opts: CacheOptions) -> Result<Self> {
        let storage = Storage::anon(opts.block_size as u64 * opts.nr_blocks)?;
        Ok(Self::from_storage(storage, opts))
    }

    fn from_storage(storage: Storage, opts: CacheOptions) -> Self {
        Self {
            storage: UnsafeCell::new(storage),
            block_size: opts.block_size,
            nr_blocks: opts.nr_blocks,
            cache_size: opts.cache_size,
            locks: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn nr_blocks(&self) -> u64 {
        self.nr_blocks
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    fn lock_for(&self, block: u64) -> Arc<BlockLock> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(block).or_insert_with(|| Arc::new(BlockLock::new())).clone()
    }

    fn check_range(&self, block: u64) -> Result<()> {
        if block >= self.nr_blocks {
            return Err(CacheError::OutOfRange { block, nr_blocks: self.nr_blocks });
        }
        Ok(())
    }

    /// # Safety
    /// Caller must hold either a read or write lock on `block` for the
    /// returned slice's entire use; this function itself does no locking.
    unsafe fn raw_block<'a>(&'a self, block: u64) -> &'a mut [u8] {
        let storage = &mut *self.storage.get();
        let start = block as usize * self.block_size;
        &mut storage.as_mut_slice()[start..start + self.block_size]
    }

    pub fn read_lock<'a>(
        &'a self,
        block: u64,
        validator: Arc<dyn Validator>,
    ) -> Result<ReadHandle<'a>> {
        self.check_range(block)?;
        let lock = self.lock_for(block);
        lock.lock_read();
        let data: &'a [u8] = unsafe { self.raw_block(block) };
        if let Err(e) = validator.check(block, data) {
            lock.unlock_read();
            return Err(e);
        }
        Ok(ReadHandle { lock, data, block })
    }

    pub fn read_try_lock<'a>(
        &'a self,
        block: u64,
        validator: Arc<dyn Validator>,
    ) -> Result<ReadHandle<'a>> {
        self.check_range(block)?;
        let lock = self.lock_for(block);
        if !lock.try_lock_read() {
            return Err(CacheError::WouldBlock { block });
        }
        let data: &'a [u8] = unsafe { self.raw_block(block) };
        if let Err(e) = validator.check(block, data) {
            lock.unlock_read();
            return Err(e);
        }
        Ok(ReadHandle { lock, data, block })
    }

    pub fn write_lock<'a>(
        &'a self,
        block: u64,
        validator: Arc<dyn Validator>,
    ) -> Result<WriteHandle<'a>> {
        self.check_range(block)?;
        let lock = self.lock_for(block);
        lock.lock_write();
        let data: &'a mut [u8] = unsafe { self.raw_block(block) };
        if let Err(e) = validator.check(block, data) {
            lock.unlock_write();
            return Err(e);
        }
        Ok(WriteHandle { cache: self, lock, data, block, validator, stamped: true })
    }

    pub fn write_try_lock<'a>(
        &'a self,
        block: u64,
        validator: Arc<dyn Validator>,
    ) -> Result<WriteHandle<'a>> {
        self.check_range(block)?;
        let lock = self.lock_for(block);
        if !lock.try_lock_write() {
            return Err(CacheError::WouldBlock { block });
        }
        let data: &'a mut [u8] = unsafe { self.raw_block(block) };
        if let Err(e) = validator.check(block, data) {
            lock.unlock_write();
            return Err(e);
        }
        Ok(WriteHandle { cache: self, lock, data, block, validator, stamped: true })
    }

    /// Write-lock a block without reading it first. The caller promises to
    /// overwrite the whole block; skipping the read also skips the
    /// validator's `check`.
    pub fn write_lock_zero<'a>(
        &'a self,
        block: u64,
        validator: Arc<dyn Validator>,
    ) -> Result<WriteHandle<'a>> {
        self.check_range(block)?;
        let lock = self.lock_for(block);
        lock.lock_write();
        let data: &'a mut [u8] = unsafe { self.raw_block(block) };
        data.fill(0);
        Ok(WriteHandle { cache: self, lock, data, block, validator, stamped: false })
    }

    /// Write-lock a block whose content is known to be stale for its
    /// self-address (freshly copied from another block by a shadow
    /// operation) without running the validator's `check` against it.
    /// The handle is always restamped on drop, which fixes the
    /// self-address and checksum for `block` regardless of what was
    /// copied in.
    pub fn write_lock_unchecked<'a>(
        &'a self,
        block: u64,
        validator: Arc<dyn Validator>,
    ) -> Result<WriteHandle<'a>> {
        self.check_range(block)?;
        let lock = self.lock_for(block);
        lock.lock_write();
        let data: &'a mut [u8] = unsafe { self.raw_block(block) };
        Ok(WriteHandle { cache: self, lock, data, block, validator, stamped: false })
    }

    pub(crate) fn mark_dirty(&self, block: u64) {
        self.dirty.lock().unwrap().insert(block);
    }

    /// Flush every dirty block, then write and flush `superblock` so it
    /// reaches stable storage strictly after everything else, and return
    /// with the superblock's write lock released.
    pub fn flush_and_unlock(&self, mut superblock: WriteHandle<'_>) -> Result<()> {
        superblock.stamp();
        let sb_block = superblock.block;

        {
            let mut dirty = self.dirty.lock().unwrap();
            dirty.remove(&sb_block);
            let storage = unsafe { &*self.storage.get() };
            for &block in dirty.iter() {
                let offset = block as usize * self.block_size;
                storage.flush_range(offset, self.block_size)?;
            }
            dirty.clear();
        }

        let storage = unsafe { &*self.storage.get() };
        let offset = sb_block as usize * self.block_size;
        storage.flush_range(offset, self.block_size)?;

        drop(superblock);
        Ok(())
    }

    /// Swap the backing device for a new one of the same size.
    ///
    /// # Safety (contract, not `unsafe fn`)
    /// Must only be called when no read or write handles are outstanding;
    /// the block cache can only be suspended for this purpose by the
    /// caller's own coordination (spec.md section 5: "only the block
    /// cache may suspend").
    pub fn rebind<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let storage = unsafe { &mut *self.storage.get() };
        storage.rebind(path)
    }

    pub fn destroy(self) {}
}
