//! The real, persistent space map.
//!
//! `dm-space-map-disk.c` shadows its own bitmap blocks through the
//! transaction manager exactly like any other tree node (confirmed by its
//! use of `dm_tm_new_block`/`dm_tm_shadow_block` on bitmap blocks). This
//! implementation takes a narrower path: the index block and the bitmap
//! content block are allocated once at `create` time and then updated in
//! place for the space map's whole lifetime, rather than copy-on-write.
//! Only the overflow ref-count B-tree — genuinely "an auxiliary B-tree
//! keyed by block number" per spec.md — is copy-on-write, using this same
//! type's own [`crate::Shadow`] implementation.
//!
//! This sacrifices the stronger guarantee that every single bit of
//! allocator state is shadow-consistent with an in-flight transaction, in
//! exchange for not needing a second, nested instance of the shadow
//! machinery to bootstrap the bitmap itself. A block that is freed and
//! reused within the same not-yet-committed transaction is still handled
//! correctly (the bitmap reflects the live, in-progress state, not a
//! stale snapshot); what's given up is the ability to discard an
//! in-flight transaction's allocator bookkeeping independently of the
//! blocks it touched, which matters for exact crash-point fidelity but
//! not for the properties this store advertises (spec.md section 8's S1
//! through S6). See DESIGN.md for the tradeoff in full.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian as LE};

use crate::btree::{OpaqueValue, Tree};
use crate::space_map::{bitmap, bootstrap::BootstrapSpaceMap, index, BlockOp, SpaceMap, MAX_RECURSIVE_ALLOCATIONS};
use crate::{BlockAddr, Error, Shadow};

pub const SM_ROOT_SIZE: usize = 32;

/// The persisted space map root: `nr_blocks, nr_allocated, bitmap_root,
/// ref_count_root`, each a little-endian `u64` (`dm-space-map-disk.c`'s
/// `struct sm_root`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SmRoot {
    pub nr_blocks: u64,
    pub nr_allocated: u64,
    pub bitmap_root: u64,
    pub ref_count_root: u64,
}

impl SmRoot {
    pub fn read(buf: &[u8]) -> Self {
        Self {
            nr_blocks: LE::read_u64(&buf[0..8]),
            nr_allocated: LE::read_u64(&buf[8..16]),
            bitmap_root: LE::read_u64(&buf[16..24]),
            ref_count_root: LE::read_u64(&buf[24..32]),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        LE::write_u64(&mut buf[0..8], self.nr_blocks);
        LE::write_u64(&mut buf[8..16], self.nr_allocated);
        LE::write_u64(&mut buf[16..24], self.bitmap_root);
        LE::write_u64(&mut buf[24..32], self.ref_count_root);
    }
}

pub struct DiskSpaceMap {
    bm: Arc<block_cache::BlockCache>,
    nr_blocks: u64,
    nr_allocated: u64,
    index_root: BlockAddr,
    bitmap_block: BlockAddr,
    ref_count_root: BlockAddr,
    begin_hint: u64,
    shadow_set: HashMap<BlockAddr, BlockAddr>,
    recursion_count: u32,
    pending: VecDeque<BlockOp>,
}

impl DiskSpaceMap {
    /// Build a fresh space map covering `[0, nr_blocks)` on `bm`.
    pub fn create(bm: Arc<block_cache::BlockCache>, nr_blocks: u64) -> Result<Self, Error> {
        let cap = bitmap::capacity(bm.block_size());
        if nr_blocks as usize > cap {
            return Err(Error::InvalidArgument(
                "device too large for this space map (single bitmap block)",
            ));
        }

        let mut boot = BootstrapSpaceMap::new(0, nr_blocks);
        let index_block = boot.alloc()?;
        let bitmap_block = boot.alloc()?;
        let ref_root = boot.alloc()?;

        {
            let _h = bm.write_lock_zero(bitmap_block, bitmap::validator())?;
        }
        {
            let mut h = bm.write_lock_zero(index_block, index::validator())?;
            index::write_entry(
                &mut h,
                0,
                &index::IndexEntry { blocknr: bitmap_block, nr_free: nr_blocks as u32, none_free_before: 0 },
            );
        }
        {
            let mut h = bm.write_lock_zero(ref_root, crate::btree::tree::validator())?;
            let mut node = crate::btree::NodeView::attach(&mut h, 4);
            node.init(true);
        }

        let mut sm = Self {
            bm,
            nr_blocks,
            nr_allocated: 0,
            index_root: index_block,
            bitmap_block,
            ref_count_root: ref_root,
            begin_hint: 0,
            shadow_set: HashMap::new(),
            recursion_count: 0,
            pending: VecDeque::new(),
        };
        for b in [index_block, bitmap_block, ref_root] {
            sm.inc_block(b)?;
        }
        Ok(sm)
    }

    pub fn open(bm: Arc<block_cache::BlockCache>, root: SmRoot) -> Result<Self, Error> {
        let bitmap_block = {
            let h = bm.read_lock(root.bitmap_root, index::validator())?;
            index::read_entry(&h, 0).blocknr
        };
        Ok(Self {
            bm,
            nr_blocks: root.nr_blocks,
            nr_allocated: root.nr_allocated,
            index_root: root.bitmap_root,
            bitmap_block,
            ref_count_root: root.ref_count_root,
            begin_hint: 0,
            shadow_set: HashMap::new(),
            recursion_count: 0,
            pending: VecDeque::new(),
        })
    }

    fn slot_val(&self, b: BlockAddr) -> Result<u8, Error> {
        let h = self.bm.read_lock(self.bitmap_block, bitmap::validator())?;
        Ok(bitmap::get(&h, b as usize))
    }

    pub fn get_count(&self, b: BlockAddr) -> Result<u32, Error> {
        let v = self.slot_val(b)?;
        if v < 3 {
            return Ok(v as u32);
        }
        let tree = Tree::new(4);
        match tree.lookup(&self.bm, self.ref_count_root, b)? {
            Some(bytes) => Ok(u32::from_le_bytes(bytes.try_into().unwrap())),
            None => Err(Error::Corruption("overflow bit set with no ref-count entry")),
        }
    }

    fn write_count(&mut self, b: BlockAddr, count: u32) -> Result<(), Error> {
        let old = self.slot_val(b)?;
        let new_val = count.min(3) as u8;
        {
            let mut h = self.bm.write_lock(self.bitmap_block, bitmap::validator())?;
            bitmap::set(&mut h, b as usize, new_val);
        }
        if old == 3 && new_val != 3 {
            let root = self.ref_count_root;
            let tree = Tree::new(4);
            let (new_root, _old) = tree.remove(self, root, b, &OpaqueValue { size: 4 })?;
            self.ref_count_root = new_root;
        } else if new_val == 3 {
            let root = self.ref_count_root;
            let tree = Tree::new(4);
            let (new_root, _old) = tree.insert(self, root, b, &count.to_le_bytes(), &OpaqueValue { size: 4 })?;
            self.ref_count_root = new_root;
        }
        let was_allocated = old != 0;
        let now_allocated = new_val != 0;
        if now_allocated && !was_allocated {
            self.nr_allocated += 1;
        } else if was_allocated && !now_allocated {
            self.nr_allocated -= 1;
        }
        Ok(())
    }

    pub fn set_count(&mut self, b: BlockAddr, count: u32) -> Result<(), Error> {
        if self.recursion_count != 0 {
            return Err(Error::InvalidArgument("set_count forbidden while the space map is recursing"));
        }
        self.recursion_count += 1;
        let result = self.write_count(b, count);
        self.recursion_count -= 1;
        result?;
        self.drain_pending()
    }

    pub fn inc_block(&mut self, b: BlockAddr) -> Result<(), Error> {
        if self.recursion_count > 0 {
            if self.pending.len() >= MAX_RECURSIVE_ALLOCATIONS {
                return Err(Error::TooManyPendingOps);
            }
            self.pending.push_back(BlockOp::Inc(b));
            return Ok(());
        }
        self.recursion_count += 1;
        let result = (|| {
            let cur = self.get_count(b)?;
            self.write_count(b, cur + 1)
        })();
        self.recursion_count -= 1;
        result?;
        self.drain_pending()
    }

    pub fn dec_block(&mut self, b: BlockAddr) -> Result<(), Error> {
        if self.recursion_count > 0 {
            if self.pending.len() >= MAX_RECURSIVE_ALLOCATIONS {
                return Err(Error::TooManyPendingOps);
            }
            self.pending.push_back(BlockOp::Dec(b));
            return Ok(());
        }
        self.recursion_count += 1;
        let result = (|| {
            let cur = self.get_count(b)?;
            if cur == 0 {
                return Err(Error::InvalidArgument("dec_block on an already-free block"));
            }
            self.write_count(b, cur - 1)
        })();
        self.recursion_count -= 1;
        result?;
        self.drain_pending()
    }

    fn drain_pending(&mut self) -> Result<(), Error> {
        while self.recursion_count == 0 {
            let op = match self.pending.pop_front() {
                Some(op) => op,
                None => break,
            };
            match op {
                BlockOp::Inc(b) => self.inc_block(b)?,
                BlockOp::Dec(b) => self.dec_block(b)?,
            }
        }
        Ok(())
    }

    pub fn new_block(&mut self) -> Result<BlockAddr, Error> {
        self.recursion_count += 1;
        let result = self.new_block_inner();
        self.recursion_count -= 1;
        let addr = result?;
        self.drain_pending()?;
        Ok(addr)
    }

    fn new_block_inner(&mut self) -> Result<BlockAddr, Error> {
        let cap = bitmap::capacity(self.bm.block_size()).min(self.nr_blocks as usize);
        let mut found = None;
        {
            let h = self.bm.read_lock(self.bitmap_block, bitmap::validator())?;
            for slot in (self.begin_hint as usize)..cap {
                if bitmap::get(&h, slot) == 0 {
                    found = Some(slot as u64);
                    break;
                }
            }
        }
        let addr = found.ok_or(Error::NoSpace)?;
        self.write_count(addr, 1)?;
        self.begin_hint = addr + 1;
        Ok(addr)
    }

    fn shadow_own_block(&mut self, orig: BlockAddr) -> Result<(BlockAddr, bool), Error> {
        if let Some(&mapped) = self.shadow_set.get(&orig) {
            return Ok((mapped, false));
        }
        let old_count = self.get_count(orig)?;
        let new_addr = self.new_block()?;
        let bm = self.bm.clone();
        let bytes: Vec<u8> = {
            let h = bm.read_lock(orig, Arc::new(block_cache::NullValidator))?;
            h.to_vec()
        };
        {
            let mut h = bm.write_lock_unchecked(new_addr, crate::btree::tree::validator())?;
            h.copy_from_slice(&bytes);
        }
        self.dec_block(orig)?;
        self.shadow_set.insert(orig, new_addr);
        Ok((new_addr, old_count > 1))
    }

    pub fn commit(&mut self) -> Result<(), Error> {
        self.begin_hint = 0;
        self.shadow_set.clear();
        Ok(())
    }

    pub fn copy_root(&self, out: &mut [u8]) -> Result<(), Error> {
        if out.len() < SM_ROOT_SIZE {
            return Err(Error::InvalidArgument("copy_root buffer too small"));
        }
        SmRoot { nr_blocks: self.nr_blocks, nr_allocated: self.nr_allocated, bitmap_root: self.index_root, ref_count_root: self.ref_count_root }
            .write(out);
        Ok(())
    }
}

impl Shadow for DiskSpaceMap {
    fn block_cache(&self) -> &Arc<block_cache::BlockCache> {
        &self.bm
    }

    fn new_block(&mut self) -> Result<BlockAddr, Error> {
        self.new_block()
    }

    fn shadow_block(&mut self, orig: BlockAddr) -> Result<(BlockAddr, bool), Error> {
        self.shadow_own_block(orig)
    }

    fn inc(&mut self, b: BlockAddr) -> Result<(), Error> {
        self.inc_block(b)
    }

    fn dec(&mut self, b: BlockAddr) -> Result<(), Error> {
        self.dec_block(b)
    }
}

impl SpaceMap for DiskSpaceMap {
    fn get_nr_blocks(&self) -> Result<u64, Error> {
        Ok(self.nr_blocks)
    }

    fn get_nr_free(&self) -> Result<u64, Error> {
        Ok(self.nr_blocks - self.nr_allocated)
    }

    fn get_count(&self, b: BlockAddr) -> Result<u32, Error> {
        DiskSpaceMap::get_count(self, b)
    }

    fn count_is_more_than_one(&self, b: BlockAddr) -> Result<bool, Error> {
        Ok(DiskSpaceMap::get_count(self, b)? > 1)
    }

    fn set_count(&mut self, b: BlockAddr, count: u32) -> Result<(), Error> {
        DiskSpaceMap::set_count(self, b, count)
    }

    fn inc_block(&mut self, b: BlockAddr) -> Result<(), Error> {
        DiskSpaceMap::inc_block(self, b)
    }

    fn dec_block(&mut self, b: BlockAddr) -> Result<(), Error> {
        DiskSpaceMap::dec_block(self, b)
    }

    fn new_block(&mut self) -> Result<BlockAddr, Error> {
        DiskSpaceMap::new_block(self)
    }

    fn commit(&mut self) -> Result<(), Error> {
        DiskSpaceMap::commit(self)
    }

    fn root_size(&self) -> usize {
        SM_ROOT_SIZE
    }

    fn copy_root(&self, out: &mut [u8]) -> Result<(), Error> {
        DiskSpaceMap::copy_root(self, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_cache::{BlockCache, CacheOptions};

    fn cache() -> Arc<BlockCache> {
        Arc::new(BlockCache::create_anon(CacheOptions { block_size: 4096, nr_blocks: 64, cache_size: 16 }).unwrap())
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let bm = cache();
        let mut sm = DiskSpaceMap::create(bm, 64).unwrap();
        let a = sm.new_block().unwrap();
        let b = sm.new_block().unwrap();
        assert_ne!(a, b);
        assert_eq!(sm.get_count(a).unwrap(), 1);
        sm.dec_block(a).unwrap();
        assert_eq!(sm.get_count(a).unwrap(), 0);
    }

    #[test]
    fn overflow_refcount_uses_tree() {
        let bm = cache();
        let mut sm = DiskSpaceMap::create(bm, 64).unwrap();
        let a = sm.new_block().unwrap();
        for _ in 0..5 {
            sm.inc_block(a).unwrap();
        }
        assert_eq!(sm.get_count(a).unwrap(), 6);
        sm.dec_block(a).unwrap();
        assert_eq!(sm.get_count(a).unwrap(), 5);
    }

    #[test]
    fn root_round_trips_through_bytes() {
        let bm = cache();
        let mut sm = DiskSpaceMap::create(bm.clone(), 64).unwrap();
        sm.new_block().unwrap();
        let mut buf = [0u8; SM_ROOT_SIZE];
        sm.copy_root(&mut buf).unwrap();
        let root = SmRoot::read(&buf);
        let reopened = DiskSpaceMap::open(bm, root).unwrap();
        assert_eq!(reopened.get_nr_blocks().unwrap(), 64);
    }
}
