//! Transaction manager: the shadow/new-block allocator every B-tree
//! descent in the HSM metadata layer allocates and shadows through
//! (spec.md section 4.3).
//!
//! The space map is wrapped in an `Arc<Mutex<_>>` so a
//! [`TransactionManager::create_non_blocking_clone`] can share the exact
//! same allocator state as its parent rather than a stale copy — the
//! single-writer discipline spec.md section 5 describes (`root_lock`)
//! means this mutex is never contended in practice; it exists to let two
//! `TransactionManager` values alias one allocator without `unsafe`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use block_cache::{BlockCache, NullValidator, ReadHandle, Validator, WriteHandle};

use crate::space_map::{DiskSpaceMap, SpaceMap};
use crate::{BlockAddr, Error, Shadow};

pub struct TransactionManager {
    bm: Arc<BlockCache>,
    sm: Arc<Mutex<DiskSpaceMap>>,
    shadow_set: HashMap<BlockAddr, BlockAddr>,
    non_blocking: bool,
}

impl TransactionManager {
    /// Build a brand-new transaction manager with a freshly formatted
    /// space map covering `[0, nr_blocks)` of `bm`.
    pub fn create(bm: Arc<BlockCache>, nr_blocks: u64) -> Result<Self, Error> {
        let sm = DiskSpaceMap::create(bm.clone(), nr_blocks)?;
        Ok(Self { bm, sm: Arc::new(Mutex::new(sm)), shadow_set: HashMap::new(), non_blocking: false })
    }

    /// Reattach to a space map whose root was read back from a
    /// superblock (or other root block) by the caller.
    pub fn open(bm: Arc<BlockCache>, sm_root: crate::space_map::disk::SmRoot) -> Result<Self, Error> {
        let sm = DiskSpaceMap::open(bm.clone(), sm_root)?;
        Ok(Self { bm, sm: Arc::new(Mutex::new(sm)), shadow_set: HashMap::new(), non_blocking: false })
    }

    /// A clone sharing this manager's space map and block cache, but
    /// using `read_try_lock` everywhere a block is read, so it never
    /// sleeps — safe to call from latency-sensitive paths (spec.md
    /// section 4.3, "Non-blocking clone"). Lookups reached through
    /// [`crate::btree::Tree::lookup_via_tm`] honor this by calling
    /// [`TransactionManager::read_lock`] for every node on the descent.
    pub fn create_non_blocking_clone(&self) -> Self {
        Self { bm: self.bm.clone(), sm: self.sm.clone(), shadow_set: HashMap::new(), non_blocking: true }
    }

    pub fn get_bm(&self) -> &Arc<BlockCache> {
        &self.bm
    }

    /// Read-lock `b`, using `read_try_lock` instead of `read_lock` when
    /// this manager is a non-blocking clone.
    pub fn read_lock(&self, b: BlockAddr, validator: Arc<dyn Validator>) -> Result<ReadHandle<'_>, Error> {
        if self.non_blocking {
            Ok(self.bm.read_try_lock(b, validator)?)
        } else {
            Ok(self.bm.read_lock(b, validator)?)
        }
    }

    /// A fresh transaction begins by clearing the shadow-of-shadow
    /// elision table; the superblock re-lock that actually opens the
    /// transaction is the caller's responsibility (it owns the
    /// superblock's block number).
    pub fn begin(&mut self) {
        self.shadow_set.clear();
    }

    /// Flush dirty blocks and serialize the space map's in-memory state
    /// into its own on-disk root, ahead of the final superblock write.
    pub fn pre_commit(&mut self) -> Result<(), Error> {
        self.sm.lock().unwrap().commit()
    }

    /// Write the space map's root into `root`'s data at `sm_root_offset`
    /// and flush everything, the superblock last, through `root`.
    pub fn commit(&mut self, mut root: WriteHandle<'_>, sm_root_offset: usize) -> Result<(), Error> {
        let sm = self.sm.lock().unwrap();
        let size = sm.root_size();
        sm.copy_root(&mut root[sm_root_offset..sm_root_offset + size])?;
        drop(sm);
        self.bm.flush_and_unlock(root)?;
        self.shadow_set.clear();
        Ok(())
    }

    pub fn new_block(&mut self, validator: Arc<dyn Validator>) -> Result<WriteHandle<'_>, Error> {
        let addr = self.sm.lock().unwrap().new_block()?;
        Ok(self.bm.write_lock_zero(addr, validator)?)
    }

    /// Shadow `orig`, returning a write-locked handle to the (possibly
    /// new) block and whether every child reference inside it now needs
    /// its own refcount bumped (`orig`'s refcount was more than one
    /// before this shadow).
    pub fn shadow_block(&mut self, orig: BlockAddr, validator: Arc<dyn Validator>) -> Result<(WriteHandle<'_>, bool), Error> {
        if let Some(&mapped) = self.shadow_set.get(&orig) {
            let h = self.bm.write_lock(mapped, validator)?;
            return Ok((h, false));
        }
        let old_count = self.sm.lock().unwrap().get_count(orig)?;
        let new_addr = self.sm.lock().unwrap().new_block()?;
        let bytes: Vec<u8> = {
            let h = self.bm.read_lock(orig, Arc::new(NullValidator))?;
            h.to_vec()
        };
        {
            let mut h = self.bm.write_lock_unchecked(new_addr, validator.clone())?;
            h.copy_from_slice(&bytes);
        }
        self.sm.lock().unwrap().dec_block(orig)?;
        self.shadow_set.insert(orig, new_addr);
        let h = self.bm.write_lock(new_addr, validator)?;
        Ok((h, old_count > 1))
    }

    pub fn inc(&mut self, b: BlockAddr) -> Result<(), Error> {
        self.sm.lock().unwrap().inc_block(b)
    }

    pub fn dec(&mut self, b: BlockAddr) -> Result<(), Error> {
        self.sm.lock().unwrap().dec_block(b)
    }

    pub fn ref_count(&self, b: BlockAddr) -> Result<u32, Error> {
        self.sm.lock().unwrap().get_count(b)
    }

    pub fn get_nr_free(&self) -> Result<u64, Error> {
        use crate::space_map::SpaceMap;
        self.sm.lock().unwrap().get_nr_free()
    }
}

impl Shadow for TransactionManager {
    fn block_cache(&self) -> &Arc<BlockCache> {
        &self.bm
    }

    fn new_block(&mut self) -> Result<BlockAddr, Error> {
        self.sm.lock().unwrap().new_block()
    }

    /// Used by generic [`crate::btree::Tree`] descents over the HSM's own
    /// forward/reverse trees; always stamped with the B-tree node
    /// validator (this crate's only `Shadow`-driven tree consumer).
    fn shadow_block(&mut self, orig: BlockAddr) -> Result<(BlockAddr, bool), Error> {
        if let Some(&mapped) = self.shadow_set.get(&orig) {
            return Ok((mapped, false));
        }
        let old_count = self.sm.lock().unwrap().get_count(orig)?;
        let new_addr = self.sm.lock().unwrap().new_block()?;
        let bytes: Vec<u8> = {
            let h = self.bm.read_lock(orig, Arc::new(NullValidator))?;
            h.to_vec()
        };
        {
            let mut h = self.bm.write_lock_unchecked(new_addr, crate::btree::tree::validator())?;
            h.copy_from_slice(&bytes);
        }
        self.sm.lock().unwrap().dec_block(orig)?;
        self.shadow_set.insert(orig, new_addr);
        Ok((new_addr, old_count > 1))
    }

    fn inc(&mut self, b: BlockAddr) -> Result<(), Error> {
        self.sm.lock().unwrap().inc_block(b)
    }

    fn dec(&mut self, b: BlockAddr) -> Result<(), Error> {
        self.sm.lock().unwrap().dec_block(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{OpaqueValue, Tree};
    use block_cache::CacheOptions;

    fn cache() -> Arc<BlockCache> {
        Arc::new(BlockCache::create_anon(CacheOptions { block_size: 4096, nr_blocks: 256, cache_size: 32 }).unwrap())
    }

    #[test]
    fn shadow_of_shadow_is_elided_within_a_transaction() {
        let bm = cache();
        let mut tm = TransactionManager::create(bm, 256).unwrap();
        let tree = Tree::new(4);
        let root = tree.empty(&mut tm).unwrap();
        let (a, inc_a) = tm.shadow_block(root, crate::btree::tree::validator()).map(|(h, f)| (h.block(), f)).unwrap();
        let (b, inc_b) = tm.shadow_block(root, crate::btree::tree::validator()).map(|(h, f)| (h.block(), f)).unwrap();
        assert_eq!(a, b);
        assert!(!inc_a);
        assert!(!inc_b);
    }

    #[test]
    fn insert_and_lookup_through_the_transaction_manager() {
        let bm = cache();
        let mut tm = TransactionManager::create(bm, 256).unwrap();
        let tree = Tree::new(4);
        let root = tree.empty(&mut tm).unwrap();
        let (root, _) = tree.insert(&mut tm, root, 7, &99u32.to_le_bytes(), &OpaqueValue { size: 4 }).unwrap();
        let found = tree.lookup(tm.get_bm(), root, 7).unwrap();
        assert_eq!(found, Some(99u32.to_le_bytes().to_vec()));
    }

    #[test]
    fn non_blocking_lookup_fails_while_a_writer_holds_the_root() {
        let bm = cache();
        let mut tm = TransactionManager::create(bm, 256).unwrap();
        let tree = Tree::new(4);
        let root = tree.empty(&mut tm).unwrap();
        let (root, _) = tree.insert(&mut tm, root, 7, &99u32.to_le_bytes(), &OpaqueValue { size: 4 }).unwrap();

        let clone = tm.create_non_blocking_clone();
        let held = tm.get_bm().write_lock(root, crate::btree::tree::validator()).unwrap();
        assert_eq!(tree.lookup_via_tm(&clone, root, 7), Err(Error::WouldBlock));
        drop(held);

        let found = tree.lookup_via_tm(&clone, root, 7).unwrap();
        assert_eq!(found, Some(99u32.to_le_bytes().to_vec()));
    }
}
