//! The `dm-hsm` target itself (spec.md section 4.7): wires a [`Metadata`]
//! handle, a [`Policy`], and a [`Copier`] together into the bio pipeline
//! `dm-hsm.c`'s `do_worker` drives, minus the real kernel's bio layer and
//! background workqueue — `map` only enqueues, and a caller drives
//! [`HsmTarget::run_once`] explicitly, which keeps the whole pipeline
//! deterministic and exercisable without a real thread or async runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::bio::{Bio, MapAction};
use crate::cache_block::{self, CacheBlock};
use crate::copier::{CopyDirection, CopyRequest, Copier};
use crate::error::HsmError;
use crate::metadata::Metadata;
use crate::policy::{BasicPolicy, Policy};

/// This workspace models a single cached logical device per target
/// instance, so the `device_id` half of every metadata key is fixed.
const DEVICE_ID: u32 = 0;

/// A dirty block is eligible for writeback roughly `FLUSH_DELAY_TICKS`
/// after it was last written (spec.md 4.7: "deadline ≈3·tick").
const FLUSH_DELAY_TICKS: u64 = 3;

/// Constructor arguments, parsed the way `dm-hsm.c`'s `hsm_ctr` parses its
/// table line.
pub struct TargetArgs {
    pub cached_dev: String,
    pub data_dev: String,
    pub meta_dev: String,
    pub data_block_size_sectors: u32,
}

impl TargetArgs {
    pub fn parse(args: &[&str]) -> Result<Self, HsmError> {
        let [cached_dev, data_dev, meta_dev, block_size] = args else {
            return Err(HsmError::InvalidArgument("expected <cached_dev> <data_dev> <meta_dev> <data_block_size_sectors>"));
        };
        let data_block_size_sectors: u32 =
            block_size.parse().map_err(|_| HsmError::InvalidArgument("data_block_size_sectors must be an integer"))?;
        if data_block_size_sectors < 8 || !data_block_size_sectors.is_power_of_two() {
            return Err(HsmError::InvalidArgument("data_block_size_sectors must be a power of two and at least 8 sectors"));
        }
        Ok(Self {
            cached_dev: cached_dev.to_string(),
            data_dev: data_dev.to_string(),
            meta_dev: meta_dev.to_string(),
            data_block_size_sectors,
        })
    }
}

/// Snapshot for `dm status` (spec.md section 6): the three
/// space-separated fields `STATUSTYPE_INFO` reports.
#[derive(Debug, Clone, Copy)]
pub struct Status {
    pub free_blocks: u64,
    pub allocated_blocks: u64,
    pub dirty_blocks: u64,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.free_blocks, self.allocated_blocks, self.dirty_blocks)
    }
}

pub struct HsmTarget {
    cached_dev: String,
    data_dev: String,
    meta_dev: String,

    metadata: Mutex<Metadata>,
    policy: Mutex<Box<dyn Policy>>,
    copier: Mutex<Copier>,

    block_shift: u32,
    block_size_sectors: u64,

    cache_blocks: Mutex<HashMap<u64, CacheBlock>>,
    ingress: Mutex<VecDeque<Bio>>,
    no_space: Mutex<VecDeque<Bio>>,
    pending_copy_in: Mutex<VecDeque<(u64, u64)>>,

    bounce_mode: AtomicBool,
    no_space_flag: AtomicBool,
    evict_cursor: AtomicU64,
    clock: AtomicU64,
}

impl HsmTarget {
    /// `ctr`: open (or create) the metadata device and build a fresh
    /// runtime state. `data_nr_blocks` is the fast device's capacity in
    /// cache blocks.
    pub fn ctr(
        args: TargetArgs,
        metadata_bm: Arc<block_cache::BlockCache>,
        data_nr_blocks: u64,
        copier_parallelism: usize,
    ) -> Result<Self, HsmError> {
        let block_shift = args.data_block_size_sectors.trailing_zeros();
        let metadata = Metadata::open(metadata_bm, args.data_block_size_sectors as u64, data_nr_blocks)?;
        Ok(Self {
            cached_dev: args.cached_dev,
            data_dev: args.data_dev,
            meta_dev: args.meta_dev,
            metadata: Mutex::new(metadata),
            policy: Mutex::new(BasicPolicy::new(data_nr_blocks as usize)),
            copier: Mutex::new(Copier::new(copier_parallelism)),
            block_shift,
            block_size_sectors: args.data_block_size_sectors as u64,
            cache_blocks: Mutex::new(HashMap::new()),
            ingress: Mutex::new(VecDeque::new()),
            no_space: Mutex::new(VecDeque::new()),
            pending_copy_in: Mutex::new(VecDeque::new()),
            bounce_mode: AtomicBool::new(false),
            no_space_flag: AtomicBool::new(false),
            evict_cursor: AtomicU64::new(0),
            clock: AtomicU64::new(0),
        })
    }

    /// `dtr`: nothing to release beyond what `Drop` already does for us.
    pub fn dtr(self) {}

    pub fn iterate_devices(&self, mut f: impl FnMut(&str)) {
        f(&self.cached_dev);
        f(&self.data_dev);
        f(&self.meta_dev);
    }

    pub fn status(&self) -> Status {
        let (allocated_blocks, total_blocks) = {
            let meta = self.metadata.lock().unwrap();
            (meta.get_provisioned_blocks(), meta.get_data_dev_size())
        };
        let dirty_blocks = self.cache_blocks.lock().unwrap().values().filter(|cb| cb.has(cache_block::DIRTY)).count() as u64;
        Status {
            free_blocks: total_blocks.saturating_sub(allocated_blocks),
            allocated_blocks,
            dirty_blocks,
        }
    }

    /// Whether the last allocation attempt hit `NoSpace` and hasn't yet
    /// been cleared by an eviction. Not part of `STATUSTYPE_INFO`; `status`
    /// reports `free_blocks` for that, this is a cheaper internal check.
    pub fn is_no_space(&self) -> bool {
        self.no_space_flag.load(Ordering::Relaxed)
    }

    /// `map`: validate, then enqueue for the worker (spec.md 4.7 step 1 —
    /// "validates (drops read-ahead, rejects discards below block size)").
    /// Returns [`MapAction::Requeue`] while suspended (`BounceMode`),
    /// matching S6's "requeue bios instead of processing them".
    pub fn map(&self, bio: Bio) -> MapAction {
        if self.bounce_mode.load(Ordering::Relaxed) {
            return MapAction::Requeue;
        }
        self.ingress.lock().unwrap().push_back(bio);
        MapAction::Submitted
    }

    pub fn tick(&self) {
        self.clock.fetch_add(1, Ordering::Relaxed);
        self.policy.lock().unwrap().tick();
    }

    /// One pass of the worker loop (spec.md section 4.7's four phases):
    /// drain completed copies, drain ingress (and parked `NoSpace` bios
    /// once space frees up), issue due writebacks, and commit once if
    /// anything mutated metadata this pass. Returns whether it mutated.
    pub fn run_once(&self) -> Result<bool, HsmError> {
        let mut mutated = false;

        self.drain_copier_completions(&mut mutated)?;
        self.issue_pending_copy_ins();
        // The simulated copier completes synchronously, so a copy-in
        // issued above is already sitting in its completed queue —
        // drain it now rather than waiting a whole extra pass.
        self.drain_copier_completions(&mut mutated)?;

        let bios: Vec<Bio> = self.ingress.lock().unwrap().drain(..).collect();
        for bio in bios {
            self.process_bio(bio, &mut mutated)?;
        }

        if self.no_space_flag.load(Ordering::Relaxed) {
            self.try_evict_one(&mut mutated)?;
        }
        if !self.no_space_flag.load(Ordering::Relaxed) {
            let parked: Vec<Bio> = self.no_space.lock().unwrap().drain(..).collect();
            for bio in parked {
                self.process_bio(bio, &mut mutated)?;
            }
        }

        self.run_writebacks();

        if mutated {
            self.metadata.lock().unwrap().commit()?;
        }
        Ok(mutated)
    }

    fn process_bio(&self, bio: Bio, mutated: &mut bool) -> Result<(), HsmError> {
        if bio.is_readahead {
            return Ok(());
        }
        if bio.is_discard && (bio.len_sectors as u64) < self.block_size_sectors {
            return Ok(());
        }

        let logical = bio.cache_block(self.block_shift) as u32;
        let (pblock, flags) = {
            let mut meta = self.metadata.lock().unwrap();
            match meta.lookup(DEVICE_ID, logical, true) {
                Ok(v) => v,
                Err(HsmError::NotFound) => match meta.insert(DEVICE_ID, logical) {
                    Ok(v) => {
                        *mutated = true;
                        v
                    }
                    Err(HsmError::NoSpace) => {
                        drop(meta);
                        self.no_space_flag.store(true, Ordering::Relaxed);
                        self.no_space.lock().unwrap().push_back(bio);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }
        };

        let mut needs_copy_in = false;
        {
            let mut blocks = self.cache_blocks.lock().unwrap();
            let cb = blocks.entry(logical as u64).or_insert_with(|| CacheBlock::new(logical as u64, pblock, flags));
            cb.acquire();

            if bio.is_write && bio.fully_overwrites_block(self.block_size_sectors) {
                cb.set(cache_block::UPTODATE | cache_block::DIRTY);
                if cb.flush_deadline.is_none() {
                    cb.flush_deadline = Some(self.clock.load(Ordering::Relaxed) + FLUSH_DELAY_TICKS);
                }
            } else if !cb.has(cache_block::UPTODATE) {
                cb.pending_io.push(bio);
                needs_copy_in = true;
            } else if bio.is_write {
                if cb.has(cache_block::DIRTY) {
                    cb.set(cache_block::FORCE_DIRTY);
                } else {
                    cb.set(cache_block::DIRTY);
                    cb.flush_deadline = Some(self.clock.load(Ordering::Relaxed) + FLUSH_DELAY_TICKS);
                }
            }

            if needs_copy_in {
                self.pending_copy_in.lock().unwrap().push_back((logical as u64, pblock));
            } else {
                cb.release();
            }
        }

        if needs_copy_in {
            return Ok(());
        }

        let flags_now = self.cache_blocks.lock().unwrap().get(&(logical as u64)).map(|cb| cb.flags).unwrap_or(flags);
        {
            let mut meta = self.metadata.lock().unwrap();
            meta.update(DEVICE_ID, logical, flags_now)?;
        }
        *mutated = true;

        if bio.is_flush || bio.is_fua {
            self.metadata.lock().unwrap().commit()?;
            *mutated = false;
        }

        Ok(())
    }

    /// Issue queued copy-ins while the copier still has capacity
    /// (spec.md 4.7's parallelism cap applies symmetrically to copy-in
    /// and writeback traffic).
    fn issue_pending_copy_ins(&self) {
        let mut copier = self.copier.lock().unwrap();
        let mut queue = self.pending_copy_in.lock().unwrap();
        while copier.has_capacity() {
            let Some((cache_block, pool_block)) = queue.pop_front() else { break };
            copier.issue(CopyRequest { cache_block, pool_block, direction: CopyDirection::ToCache });
        }
    }

    fn drain_copier_completions(&self, mutated: &mut bool) -> Result<(), HsmError> {
        let completed = self.copier.lock().unwrap().poll();
        for c in completed {
            match c.direction {
                CopyDirection::ToCache => {
                    let pending: Vec<Bio> = {
                        let mut blocks = self.cache_blocks.lock().unwrap();
                        let cb = blocks.get_mut(&c.cache_block).expect("copy-in completion for unknown cache block");
                        cb.set(cache_block::UPTODATE);
                        std::mem::take(&mut cb.pending_io)
                    };
                    let flags_now = self.cache_blocks.lock().unwrap().get(&c.cache_block).map(|cb| cb.flags).unwrap();
                    self.metadata.lock().unwrap().update(DEVICE_ID, c.cache_block as u32, flags_now)?;
                    *mutated = true;

                    let resubmitted = pending.len();
                    self.ingress.lock().unwrap().extend(pending);
                    if let Some(cb) = self.cache_blocks.lock().unwrap().get_mut(&c.cache_block) {
                        for _ in 0..resubmitted {
                            cb.release();
                        }
                    }
                }
                CopyDirection::ToSlow => {
                    let flags_now = {
                        let mut blocks = self.cache_blocks.lock().unwrap();
                        let cb = blocks.get_mut(&c.cache_block).expect("writeback completion for unknown cache block");
                        if cb.has(cache_block::FORCE_DIRTY) {
                            cb.clear(cache_block::FORCE_DIRTY);
                        } else {
                            cb.clear(cache_block::DIRTY);
                        }
                        cb.flush_deadline = None;
                        cb.release();
                        cb.flags
                    };
                    self.metadata.lock().unwrap().update(DEVICE_ID, c.cache_block as u32, flags_now)?;
                    *mutated = true;
                }
            }
        }
        Ok(())
    }

    /// Issue writebacks for dirty blocks whose deadline has passed
    /// (spec.md 4.7: "dirty blocks are enqueued with a deadline").
    fn run_writebacks(&self) {
        let now = self.clock.load(Ordering::Relaxed);
        let due: Vec<(u64, u64)> = {
            let blocks = self.cache_blocks.lock().unwrap();
            blocks
                .values()
                .filter(|cb| cb.has(cache_block::DIRTY) && cb.flush_deadline.is_some_and(|d| d <= now))
                .map(|cb| (cb.cache_block, cb.pool_block))
                .collect()
        };
        let mut copier = self.copier.lock().unwrap();
        for (cache_block, pool_block) in due {
            if !copier.has_capacity() {
                break;
            }
            if copier.issue(CopyRequest { cache_block, pool_block, direction: CopyDirection::ToSlow }) {
                if let Some(cb) = self.cache_blocks.lock().unwrap().get_mut(&cache_block) {
                    cb.acquire();
                    cb.flush_deadline = None;
                }
            }
        }
    }

    /// Eviction (spec.md section 9's redesign flag): a deterministic
    /// round-robin scan over `pool_block`s with a resume cursor, rather
    /// than the original's random pick that can spin without finding an
    /// idle candidate even when one exists.
    fn try_evict_one(&self, mutated: &mut bool) -> Result<(), HsmError> {
        let data_nr_blocks = self.metadata.lock().unwrap().get_data_dev_size();
        if data_nr_blocks == 0 {
            return Ok(());
        }
        let start = self.evict_cursor.load(Ordering::Relaxed) % data_nr_blocks;
        for offset in 0..data_nr_blocks {
            let pblock = (start + offset) % data_nr_blocks;
            let lblock = {
                let meta = self.metadata.lock().unwrap();
                match meta.lookup_reverse(DEVICE_ID, pblock, true) {
                    Ok(l) => l,
                    Err(HsmError::NotFound) => continue,
                    Err(e) => return Err(e),
                }
            };
            let idle = {
                let blocks = self.cache_blocks.lock().unwrap();
                blocks.get(&(lblock as u64)).map_or(true, CacheBlock::is_idle)
            };
            if !idle {
                continue;
            }

            {
                let mut meta = self.metadata.lock().unwrap();
                meta.remove(DEVICE_ID, lblock)?;
            }
            self.cache_blocks.lock().unwrap().remove(&(lblock as u64));
            self.evict_cursor.store((pblock + 1) % data_nr_blocks, Ordering::Relaxed);
            self.no_space_flag.store(false, Ordering::Relaxed);
            *mutated = true;
            return Ok(());
        }
        Ok(())
    }

    /// `presuspend`: stop admitting new bios; future `map` calls are
    /// requeued to the caller instead of processed.
    pub fn presuspend(&self) {
        self.bounce_mode.store(true, Ordering::Relaxed);
    }

    /// `postsuspend`: drain whatever was already queued, flush and commit,
    /// then hand back every bio that didn't finish so the caller can
    /// resubmit it after resume (S6: "all complete... before postsuspend
    /// returns").
    pub fn postsuspend(&self) -> Result<Vec<Bio>, HsmError> {
        while self.run_once()? {}

        let mut stranded: Vec<Bio> = self.ingress.lock().unwrap().drain(..).collect();
        stranded.extend(self.no_space.lock().unwrap().drain(..));
        for cb in self.cache_blocks.lock().unwrap().values_mut() {
            stranded.extend(cb.pending_io.drain(..));
        }

        self.metadata.lock().unwrap().commit()?;
        Ok(stranded)
    }

    /// `preresume`: crash recovery (spec.md 4.7 — "walks every pool_block
    /// in the reverse map; any entry whose persisted flags contain Dirty
    /// is re-queued for flush"), then clear `BounceMode`.
    pub fn preresume(&self) -> Result<(), HsmError> {
        let now = self.clock.load(Ordering::Relaxed);
        let mut dirty_entries = Vec::new();
        self.metadata.lock().unwrap().for_each_mapping(|pblock, device, lblock, flags| {
            if device == DEVICE_ID && flags & cache_block::DIRTY != 0 {
                dirty_entries.push((lblock as u64, pblock, flags));
            }
        })?;

        let mut blocks = self.cache_blocks.lock().unwrap();
        for (lblock, pblock, flags) in dirty_entries {
            let cb = blocks.entry(lblock).or_insert_with(|| CacheBlock::new(lblock, pblock, flags));
            cb.set(cache_block::DIRTY);
            cb.flush_deadline = Some(now);
        }
        drop(blocks);

        self.bounce_mode.store(false, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_target(data_nr_blocks: u64) -> HsmTarget {
        let meta_bm = block_cache::BlockCache::create_anon(block_cache::CacheOptions {
            block_size: 4096,
            nr_blocks: 64,
            cache_size: 64,
        })
        .unwrap();
        let args = TargetArgs {
            cached_dev: "/dev/slow0".to_string(),
            data_dev: "/dev/fast0".to_string(),
            meta_dev: "/dev/meta0".to_string(),
            data_block_size_sectors: 8,
        };
        HsmTarget::ctr(args, Arc::new(meta_bm), data_nr_blocks, 4).unwrap()
    }

    fn bio(sector: u64, is_write: bool) -> Bio {
        Bio { sector, len_sectors: 8, is_write, is_flush: false, is_fua: false, is_discard: false, is_readahead: false }
    }

    #[test]
    fn full_block_write_commits_without_a_copy_in() {
        let t = make_target(4);
        assert_eq!(t.map(bio(0, true)), MapAction::Submitted);
        let mutated = t.run_once().unwrap();
        assert!(mutated);
        assert_eq!(t.status().allocated_blocks, 1);
    }

    #[test]
    fn partial_read_parks_for_a_copy_in_then_resolves() {
        let t = make_target(4);
        let mut partial = bio(0, false);
        partial.len_sectors = 4;
        assert_eq!(t.map(partial), MapAction::Submitted);
        t.run_once().unwrap();
        // Copy-in is issued synchronously by the simulated copier, so the
        // next pass observes its completion and resubmits the bio.
        let mutated = t.run_once().unwrap();
        assert!(mutated);
    }

    #[test]
    fn no_space_parks_bios_until_an_eviction_frees_one() {
        let t = make_target(1);
        assert_eq!(t.map(bio(0, true)), MapAction::Submitted);
        t.run_once().unwrap();
        // The sole pool block is idle (refcount dropped after its write
        // committed), so the same pass that parks this bio for lack of
        // space also finds that idle victim and evicts it immediately.
        assert_eq!(t.map(bio(8, true)), MapAction::Submitted);
        t.run_once().unwrap();
        assert!(!t.is_no_space());
        // The freed pool block lets the parked bio through on the next pass.
        t.run_once().unwrap();
        assert_eq!(t.status().allocated_blocks, 1);
    }

    #[test]
    fn suspend_requeues_future_bios_and_resume_replays_dirty_entries() {
        let t = make_target(4);
        assert_eq!(t.map(bio(0, true)), MapAction::Submitted);
        t.run_once().unwrap();

        t.presuspend();
        assert_eq!(t.map(bio(8, true)), MapAction::Requeue);
        let stranded = t.postsuspend().unwrap();
        assert!(stranded.is_empty());

        t.preresume().unwrap();
        assert_eq!(t.map(bio(0, true)), MapAction::Submitted);
        let mutated = t.run_once().unwrap();
        assert!(mutated);
    }
}
