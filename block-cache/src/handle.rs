use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::cache::BlockCache;
use crate::lock::BlockLock;
use crate::validator::Validator;

/// A read-locked view of a cached block. Any number of these may be held
/// concurrently for the same block, but none may coexist with a
/// [`WriteHandle`] for it.
pub struct ReadHandle<'a> {
    pub(crate) lock: Arc<BlockLock>,
    pub(crate) data: &'a [u8],
    pub(crate) block: u64,
}

impl ReadHandle<'_> {
    pub fn block(&self) -> u64 {
        self.block
    }
}

impl Deref for ReadHandle<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl Drop for ReadHandle<'_> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

/// A write-locked, exclusively-held view of a cached block.
///
/// Dropping the handle (or calling [`BlockCache::unlock`]) stamps the
/// block with its validator and marks it dirty; actual writeback to the
/// backing device happens asynchronously except when the block is passed
/// through [`BlockCache::flush_and_unlock`].
pub struct WriteHandle<'a> {
    pub(crate) cache: &'a BlockCache,
    pub(crate) lock: Arc<BlockLock>,
    pub(crate) data: &'a mut [u8],
    pub(crate) block: u64,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) stamped: bool,
}

impl WriteHandle<'_> {
    pub fn block(&self) -> u64 {
        self.block
    }

    /// Stamp the block now (idempotent). Called automatically on drop and
    /// by [`BlockCache::flush_and_unlock`] before issuing the write.
    pub(crate) fn stamp(&mut self) {
        if !self.stamped {
            self.validator.prepare_for_write(self.block, self.data);
            self.stamped = true;
        }
    }
}

impl Deref for WriteHandle<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl DerefMut for WriteHandle<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.stamped = false;
        self.data
    }
}

impl Drop for WriteHandle<'_> {
    fn drop(&mut self) {
        self.stamp();
        self.cache.mark_dirty(self.block);
        self.lock.unlock_write();
    }
}
