//! HSM metadata manager (spec.md section 4.5): the forward map
//! `(device, logical block) -> (pool block, flags)` and its reverse map,
//! built over a [`TransactionManager`] and committed through the
//! superblock.
//!
//! spec.md describes the forward/reverse maps as two-level B-trees keyed
//! `(device_id, block)`, with `levels=N` trees recursively updating
//! subtree roots (section 4.4's "Multi-level trees"). That requires the
//! tree's internal-node value type to cascade reference counts into a
//! child subtree on copy/shadow — real, but out of scope for the
//! single-level [`persist_tree::btree::Tree`] built here (see its module
//! doc). This manager instead keys both trees with a single composite
//! `u64` (`device_id` in the high 32 bits, logical/pool block in the low
//! 32), which keeps every externally observable operation
//! (`insert/remove/update/lookup/lookup_reverse`) working against one
//! flat tree. The cost, recorded in DESIGN.md, is that `delete(dev)` can
//! no longer drop a whole device's mappings in one O(1) subtree
//! unshare — the caller must enumerate the device's logical blocks.
//!
//! Pool-block allocation is a bump counter plus an in-memory recycle
//! list (`free_pool_blocks`), not a second persistent space map over the
//! data device — see DESIGN.md. A real target would give the data device
//! its own `DiskSpaceMap` the way the metadata device has one; blocks
//! freed before the last commit and not yet reused are not recoverable
//! after a reopen, only within the handle's lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use persist_tree::btree::{OpaqueValue, Tree};
use persist_tree::tm::TransactionManager;

use crate::error::HsmError;
use crate::superblock::{self, Superblock};

const FLAG_SHIFT: u32 = 60;
const PBLOCK_MASK: u64 = (1 << FLAG_SHIFT) - 1;

fn composite_key(device: u32, block: u32) -> u64 {
    ((device as u64) << 32) | block as u64
}

fn pack_leaf(pblock: u64, flags: u8) -> [u8; 8] {
    (((flags as u64) << FLAG_SHIFT) | (pblock & PBLOCK_MASK)).to_le_bytes()
}

fn unpack_leaf(value: &[u8]) -> (u64, u8) {
    let word = u64::from_le_bytes(value.try_into().unwrap());
    (word & PBLOCK_MASK, (word >> FLAG_SHIFT) as u8)
}

fn pack_rev(device: u32, block: u32) -> [u8; 8] {
    (((device as u64) << 32) | block as u64).to_le_bytes()
}

fn unpack_rev(value: &[u8]) -> (u32, u32) {
    let word = u64::from_le_bytes(value.try_into().unwrap());
    ((word >> 32) as u32, word as u32)
}

pub struct Metadata {
    tm: TransactionManager,
    forward_root: u64,
    reverse_root: u64,
    first_free_block: u64,
    /// Pool blocks released by `remove` since this handle was opened,
    /// recycled by `insert` before bumping `first_free_block`. This list
    /// is not itself persisted — see this module's doc comment.
    free_pool_blocks: Vec<u64>,
    metadata_block_size: u64,
    metadata_nr_blocks: u64,
    data_block_size: u64,
    data_nr_blocks: u64,
}

const SB_BLOCK: u64 = 0;

impl Metadata {
    /// Open the metadata device, creating a fresh superblock if block 0
    /// doesn't carry a valid one (spec.md 4.5: "creates on zero
    /// superblock, else reads").
    pub fn open(
        bm: Arc<block_cache::BlockCache>,
        data_block_size: u64,
        data_nr_blocks: u64,
    ) -> Result<Self, HsmError> {
        let existing = {
            let h = bm.read_lock(SB_BLOCK, superblock::validator());
            match h {
                Ok(h) => Superblock::read(&h).ok(),
                Err(_) => None,
            }
        };

        match existing {
            Some(sb) => {
                let tm = TransactionManager::open(bm, sb.sm_root)?;
                Ok(Self {
                    tm,
                    forward_root: sb.forward_root,
                    reverse_root: sb.reverse_root,
                    first_free_block: sb.first_free_block,
                    free_pool_blocks: Vec::new(),
                    metadata_block_size: sb.metadata_block_size,
                    metadata_nr_blocks: sb.metadata_nr_blocks,
                    data_block_size: sb.data_block_size,
                    data_nr_blocks: sb.data_nr_blocks,
                })
            }
            None => {
                let metadata_nr_blocks = bm.nr_blocks();
                let metadata_block_size = bm.block_size() as u64;
                let mut tm = TransactionManager::create(bm, metadata_nr_blocks)?;
                let tree = Tree::new(8);
                let forward_root = tree.empty(&mut tm)?;
                let reverse_root = tree.empty(&mut tm)?;
                let mut md = Self {
                    tm,
                    forward_root,
                    reverse_root,
                    first_free_block: 0,
                    free_pool_blocks: Vec::new(),
                    metadata_block_size,
                    metadata_nr_blocks,
                    data_block_size,
                    data_nr_blocks,
                };
                md.commit()?;
                Ok(md)
            }
        }
    }

    fn forward(&self) -> Tree {
        Tree::new(8)
    }

    fn reverse(&self) -> Tree {
        Tree::new(8)
    }

    pub fn insert(&mut self, device: u32, lblock: u32) -> Result<(u64, u8), HsmError> {
        let key = composite_key(device, lblock);
        if let Some(v) = self.forward().lookup(self.tm.get_bm(), self.forward_root, key)? {
            return Ok(unpack_leaf(&v));
        }
        let pblock = match self.free_pool_blocks.pop() {
            Some(recycled) => recycled,
            None => {
                if self.first_free_block >= self.data_nr_blocks {
                    return Err(HsmError::NoSpace);
                }
                let pblock = self.first_free_block;
                self.first_free_block += 1;
                pblock
            }
        };

        let leaf = pack_leaf(pblock, 0);
        let (new_forward, _) = self.forward().insert(&mut self.tm, self.forward_root, key, &leaf, &OpaqueValue { size: 8 })?;
        self.forward_root = new_forward;

        let rev = pack_rev(device, lblock);
        let (new_reverse, _) = self.reverse().insert(&mut self.tm, self.reverse_root, pblock, &rev, &OpaqueValue { size: 8 })?;
        self.reverse_root = new_reverse;

        Ok((pblock, 0))
    }

    pub fn remove(&mut self, device: u32, lblock: u32) -> Result<(), HsmError> {
        let key = composite_key(device, lblock);
        let (new_forward, old) = self.forward().remove(&mut self.tm, self.forward_root, key, &OpaqueValue { size: 8 })?;
        self.forward_root = new_forward;
        let old = old.ok_or(HsmError::NotFound)?;
        let (pblock, _flags) = unpack_leaf(&old);
        let (new_reverse, _) = self.reverse().remove(&mut self.tm, self.reverse_root, pblock, &OpaqueValue { size: 8 })?;
        self.reverse_root = new_reverse;
        self.free_pool_blocks.push(pblock);
        Ok(())
    }

    pub fn update(&mut self, device: u32, lblock: u32, flags: u8) -> Result<(), HsmError> {
        let key = composite_key(device, lblock);
        let existing = self.forward().lookup(self.tm.get_bm(), self.forward_root, key)?.ok_or(HsmError::NotFound)?;
        let (pblock, _) = unpack_leaf(&existing);
        let leaf = pack_leaf(pblock, flags);
        let (new_forward, _) = self.forward().insert(&mut self.tm, self.forward_root, key, &leaf, &OpaqueValue { size: 8 })?;
        self.forward_root = new_forward;
        Ok(())
    }

    pub fn lookup(&self, device: u32, lblock: u32, can_block: bool) -> Result<(u64, u8), HsmError> {
        let key = composite_key(device, lblock);
        let v = if can_block {
            self.forward().lookup(self.tm.get_bm(), self.forward_root, key)?
        } else {
            let clone = self.tm.create_non_blocking_clone();
            self.forward().lookup_via_tm(&clone, self.forward_root, key)?
        };
        v.map(|v| unpack_leaf(&v)).ok_or(HsmError::NotFound)
    }

    pub fn lookup_reverse(&self, device: u32, pblock: u64, can_block: bool) -> Result<u32, HsmError> {
        let v = if can_block {
            self.reverse().lookup(self.tm.get_bm(), self.reverse_root, pblock)?
        } else {
            let clone = self.tm.create_non_blocking_clone();
            self.reverse().lookup_via_tm(&clone, self.reverse_root, pblock)?
        };
        let v = v.ok_or(HsmError::NotFound)?;
        let (d, l) = unpack_rev(&v);
        if d != device {
            return Err(HsmError::NotFound);
        }
        Ok(l)
    }

    /// Walk every `(pool_block, device, lblock, flags)` entry currently
    /// recorded, for crash-recovery scans (spec.md 4.7's "walks every
    /// pool_block in the reverse map"). Flags come from the forward map,
    /// since the reverse map itself only carries `(device, lblock)`.
    pub fn for_each_mapping(&self, mut f: impl FnMut(u64, u32, u32, u8)) -> Result<(), HsmError> {
        let mut err = None;
        self.reverse().for_each(self.tm.get_bm(), self.reverse_root, &mut |pblock, v| {
            if err.is_some() {
                return;
            }
            let (device, lblock) = unpack_rev(v);
            match self.lookup(device, lblock, true) {
                Ok((_, flags)) => f(pblock, device, lblock, flags),
                Err(e) => err = Some(e),
            }
        })?;
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove every mapping in `lblocks` for `device`. See this module's
    /// doc comment: without a genuine two-level tree there is no
    /// subtree to drop in one step, so the caller supplies the set of
    /// logical blocks to remove.
    pub fn delete(&mut self, device: u32, lblocks: &[u32]) -> Result<(), HsmError> {
        for &lblock in lblocks {
            match self.remove(device, lblock) {
                Ok(()) | Err(HsmError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn get_data_dev_size(&self) -> u64 {
        self.data_nr_blocks
    }

    pub fn get_provisioned_blocks(&self) -> u64 {
        self.first_free_block
    }

    pub fn resize_data_dev(&mut self, new_size: u64) -> Result<(), HsmError> {
        if new_size < self.first_free_block {
            return Err(HsmError::InvalidArgument("cannot shrink data device below its provisioned high-water mark"));
        }
        self.data_nr_blocks = new_size;
        Ok(())
    }

    /// Serialize the space map, then write every other superblock field
    /// and hand the locked block to the transaction manager, which
    /// overwrites the `sm_root` sub-range with the authoritative bytes
    /// and flushes (spec.md 4.3's two-phase commit).
    pub fn commit(&mut self) -> Result<(), HsmError> {
        self.tm.pre_commit()?;
        let bm = self.tm.get_bm().clone();
        let mut h = bm.write_lock(SB_BLOCK, superblock::validator())?;
        let sb = Superblock {
            metadata_block_size: self.metadata_block_size,
            metadata_nr_blocks: self.metadata_nr_blocks,
            data_block_size: self.data_block_size,
            data_nr_blocks: self.data_nr_blocks,
            first_free_block: self.first_free_block,
            forward_root: self.forward_root,
            reverse_root: self.reverse_root,
            sm_root: persist_tree::space_map::disk::SmRoot { nr_blocks: 0, nr_allocated: 0, bitmap_root: 0, ref_count_root: 0 },
        };
        sb.write(&mut h);
        self.tm.commit(h, superblock::SM_ROOT_OFFSET)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon_device(nr_blocks: u64) -> Arc<block_cache::BlockCache> {
        Arc::new(block_cache::BlockCache::create_anon(block_cache::CacheOptions { block_size: 4096, nr_blocks, cache_size: nr_blocks as usize }).unwrap())
    }

    #[test]
    fn non_blocking_lookup_succeeds_when_nothing_contends_it() {
        let bm = anon_device(32);
        let mut md = Metadata::open(bm, 8, 16).unwrap();
        let (pblock, _) = md.insert(0, 3).unwrap();
        md.commit().unwrap();

        let (found_pblock, flags) = md.lookup(0, 3, false).unwrap();
        assert_eq!(found_pblock, pblock);
        assert_eq!(flags, 0);
    }

    #[test]
    fn non_blocking_lookup_reports_not_found_for_a_missing_key_without_blocking() {
        let bm = anon_device(32);
        let md = Metadata::open(bm, 8, 16).unwrap();
        assert!(matches!(md.lookup(0, 99, false), Err(HsmError::NotFound)));
    }
}

/// A caller-supplied identity for a metadata device (e.g. its path),
/// used to deduplicate concurrent opens (spec.md 4.5's "process-wide
/// handle cache").
pub type DeviceId = String;

/// Process-wide table of open [`Metadata`] handles, keyed by device
/// identity: a second `open` for the same identity returns the same
/// handle with a bumped reference count instead of reopening the device.
#[derive(Default)]
pub struct HandleRegistry {
    inner: Mutex<HashMap<DeviceId, Weak<Mutex<Metadata>>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    /// Return the existing handle for `id` if still alive, otherwise
    /// open a new one via `open_fn` and register it.
    pub fn open_or_insert(
        &self,
        id: DeviceId,
        open_fn: impl FnOnce() -> Result<Metadata, HsmError>,
    ) -> Result<Arc<Mutex<Metadata>>, HsmError> {
        let mut table = self.inner.lock().unwrap();
        if let Some(existing) = table.get(&id).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let handle = Arc::new(Mutex::new(open_fn()?));
        table.insert(id, Arc::downgrade(&handle));
        Ok(handle)
    }
}
