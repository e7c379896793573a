//! Cache policy interface (spec.md section 4.6) and a concrete `'+'`-
//! composable registry of policy types, the way `dm-cache-policy.c` and
//! `dm-cache-stack-utils.c` let a target name a stack of shim policies
//! around a core one.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub type OBlock = u64;
pub type CBlock = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapResult {
    Hit(CBlock),
    Miss,
    New(CBlock),
    Replace(CBlock, OBlock),
}

/// A hint carried alongside a `map` call (spec.md's `bio_hint`); this
/// implementation only uses it to record the end of the last sequential
/// access for `BasicPolicy`'s stream detector.
pub type BioHint = Option<OBlock>;

/// `{map, load_mapping, remove_mapping, force_mapping, residency, tick}`
/// plus optional dirty-set and writeback hooks (spec.md section 4.6).
/// `map` must be non-blocking and use only preallocated memory — this
/// implementation's `BasicPolicy` satisfies that by never allocating
/// inside `map` beyond what a `HashMap` entry API needs, matching the
/// fixed-capacity intent without a bespoke allocator.
pub trait Policy: Send {
    fn map(&mut self, oblock: OBlock, can_migrate: bool, discarded: bool, bio_hint: BioHint) -> MapResult;
    fn load_mapping(&mut self, oblock: OBlock, cblock: CBlock, dirty: bool);
    fn remove_mapping(&mut self, oblock: OBlock);
    fn force_mapping(&mut self, old_oblock: OBlock, new_oblock: OBlock);
    fn residency(&self) -> usize;
    fn tick(&mut self);
    fn set_dirty(&mut self, _cblock: CBlock) {}
    fn clear_dirty(&mut self, _cblock: CBlock) {}
    /// Next block this policy would like written back, if any.
    fn writeback_work(&mut self) -> Option<(OBlock, CBlock)> {
        None
    }
}

/// One registered policy implementation: a name (spec.md's `≤16 bytes`
/// limit) and a constructor.
pub struct PolicyType {
    pub name: &'static str,
    pub create: fn(cache_size: usize) -> Box<dyn Policy>,
}

/// Global table of policy types, composed with `'+'` (spec.md section 6,
/// "Policy registration").
#[derive(Default)]
pub struct Registry {
    types: Mutex<Vec<PolicyType>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { types: Mutex::new(Vec::new()) }
    }

    pub fn register(&self, t: PolicyType) {
        self.types.lock().unwrap().push(t);
    }

    pub fn create(&self, name: &str, cache_size: usize) -> Option<Box<dyn Policy>> {
        let types = self.types.lock().unwrap();
        types.iter().find(|t| t.name == name).map(|t| (t.create)(cache_size))
    }
}

/// Compose a policy stack's display name from `(name, hint_size)` pairs,
/// in outer-to-inner order, dropping any shim that contributes no hint
/// bytes (`dm-cache-stack-utils.c`'s convention).
pub fn compose_name(shims: &[(&str, usize)]) -> String {
    shims.iter().filter(|(_, hint_size)| *hint_size > 0).map(|(name, _)| *name).collect::<Vec<_>>().join("+")
}

/// A single-tier LRU policy with one piece of genuine ARC behavior
/// preserved from `dm-cache-policy-arc.c`: sequential I/O detection uses
/// an inclusive `>=` comparison against the end of the previous access,
/// not a strict `>`, so back-to-back bios that exactly abut still count
/// as one stream (see DESIGN.md's Open Questions). This is a scope cut
/// from the original's full four-list ARC (T1/T2/B1/B2): residency
/// eviction here is least-recently-used across the whole cache rather
/// than balanced between recency and frequency lists.
pub struct BasicPolicy {
    cache_size: usize,
    mapping: HashMap<OBlock, CBlock>,
    rev: HashMap<CBlock, OBlock>,
    dirty: HashSet<CBlock>,
    free: Vec<CBlock>,
    clock: u64,
    last_access: HashMap<CBlock, u64>,
    seq_next_expected: Option<OBlock>,
    seq_run_len: u32,
}

/// A stream counts as sequential once this many consecutive accesses
/// have abutted (`dm-cache-policy-arc.c`'s `SEQUENTIAL_THRESHOLD`).
const SEQUENTIAL_THRESHOLD: u32 = 4;

impl BasicPolicy {
    pub fn new(cache_size: usize) -> Box<dyn Policy> {
        Box::new(Self {
            cache_size,
            mapping: HashMap::new(),
            rev: HashMap::new(),
            dirty: HashSet::new(),
            free: (0..cache_size as CBlock).rev().collect(),
            clock: 0,
            last_access: HashMap::new(),
            seq_next_expected: None,
            seq_run_len: 0,
        })
    }

    /// `true` once four-in-a-row abutting accesses have been seen; a
    /// caller may use this to bias migration decisions toward
    /// sequential streams the way the original policy does.
    pub fn in_sequential_stream(&self) -> bool {
        self.seq_run_len >= SEQUENTIAL_THRESHOLD
    }

    fn note_access(&mut self, oblock: OBlock) {
        // Inclusive: an access that starts exactly where the last one
        // ended still counts as sequential (original uses `>=`, not `>`).
        let is_seq = self.seq_next_expected.is_some_and(|next| oblock >= next);
        self.seq_run_len = if is_seq { self.seq_run_len + 1 } else { 0 };
        self.seq_next_expected = Some(oblock + 1);
    }

    fn evict_lru(&mut self) -> Option<CBlock> {
        let victim = *self.last_access.iter().min_by_key(|(_, &t)| t)?.0;
        Some(victim)
    }
}

impl Policy for BasicPolicy {
    fn map(&mut self, oblock: OBlock, can_migrate: bool, _discarded: bool, _bio_hint: BioHint) -> MapResult {
        self.note_access(oblock);

        if let Some(&cblock) = self.mapping.get(&oblock) {
            self.last_access.insert(cblock, self.clock);
            return MapResult::Hit(cblock);
        }
        if !can_migrate {
            return MapResult::Miss;
        }
        if let Some(cblock) = self.free.pop() {
            self.mapping.insert(oblock, cblock);
            self.rev.insert(cblock, oblock);
            self.last_access.insert(cblock, self.clock);
            return MapResult::New(cblock);
        }
        let Some(victim) = self.evict_lru() else {
            return MapResult::Miss;
        };
        let old_oblock = self.rev.insert(victim, oblock).expect("lru candidate must be mapped");
        self.mapping.remove(&old_oblock);
        self.mapping.insert(oblock, victim);
        self.dirty.remove(&victim);
        self.last_access.insert(victim, self.clock);
        MapResult::Replace(victim, old_oblock)
    }

    fn load_mapping(&mut self, oblock: OBlock, cblock: CBlock, dirty: bool) {
        self.mapping.insert(oblock, cblock);
        self.rev.insert(cblock, oblock);
        self.last_access.insert(cblock, self.clock);
        self.free.retain(|&c| c != cblock);
        if dirty {
            self.dirty.insert(cblock);
        }
    }

    fn remove_mapping(&mut self, oblock: OBlock) {
        if let Some(cblock) = self.mapping.remove(&oblock) {
            self.rev.remove(&cblock);
            self.last_access.remove(&cblock);
            self.dirty.remove(&cblock);
            self.free.push(cblock);
        }
    }

    fn force_mapping(&mut self, old_oblock: OBlock, new_oblock: OBlock) {
        if let Some(cblock) = self.mapping.remove(&old_oblock) {
            self.mapping.insert(new_oblock, cblock);
            self.rev.insert(cblock, new_oblock);
        }
    }

    fn residency(&self) -> usize {
        self.mapping.len()
    }

    fn tick(&mut self) {
        self.clock += 1;
    }

    fn set_dirty(&mut self, cblock: CBlock) {
        self.dirty.insert(cblock);
    }

    fn clear_dirty(&mut self, cblock: CBlock) {
        self.dirty.remove(&cblock);
    }

    fn writeback_work(&mut self) -> Option<(OBlock, CBlock)> {
        let &cblock = self.dirty.iter().next()?;
        let &oblock = self.rev.get(&cblock)?;
        Some((oblock, cblock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_then_evicts_lru() {
        let mut p = BasicPolicy::new(2);
        assert_eq!(p.map(0, true, false, None), MapResult::New(1));
        p.tick();
        assert_eq!(p.map(1, true, false, None), MapResult::New(0));
        p.tick();
        // Both slots full; oblock 0 is now the LRU.
        match p.map(2, true, false, None) {
            MapResult::Replace(_, 0) => {}
            other => panic!("expected eviction of oblock 0, got {other:?}"),
        }
    }

    #[test]
    fn sequential_threshold_is_inclusive() {
        let mut p = BasicPolicy {
            cache_size: 8,
            mapping: HashMap::new(),
            rev: HashMap::new(),
            dirty: HashSet::new(),
            free: (0..8).collect(),
            clock: 0,
            last_access: HashMap::new(),
            seq_next_expected: None,
            seq_run_len: 0,
        };
        for oblock in 0..SEQUENTIAL_THRESHOLD as u64 {
            p.map(oblock, true, false, None);
        }
        assert!(p.in_sequential_stream());
    }

    #[test]
    fn compose_name_drops_zero_hint_shims() {
        assert_eq!(compose_name(&[("smq", 4), ("hint_only", 0), ("mq", 0)]), "smq");
    }
}
