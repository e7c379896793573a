//! Bounded-lock-window helpers for descending a tree.
//!
//! Lookups never shadow, so a spine only ever needs a read lock on the
//! current node and (briefly, while stepping down) its parent — at most
//! two held locks, per spec.md section 4.4's Design Notes. Mutating
//! descents (insert/remove) shadow as they go; those are implemented
//! directly in `tree.rs` with explicit scoping rather than a spine type,
//! since each step there already drops the parent's handle before
//! acquiring the child's once the child's new (post-shadow) address is
//! known.
//!
//! Two spine types share that shape but differ in how they acquire a
//! node's lock: [`RoSpine`] always blocks, for lookups made directly
//! against a `BlockCache` (the space map's own overflow ref-count tree
//! has no transaction manager to route through). [`TmSpine`] instead
//! goes through `TransactionManager::read_lock`, which blocks or not
//! depending on whether that manager is a non-blocking clone (spec.md
//! 4.3's "Non-blocking clone", 4.5's `can_block = false`).

use std::sync::Arc;

use block_cache::{BlockCache, ReadHandle, Validator};

use crate::tm::TransactionManager;
use crate::{BlockAddr, Error};

pub struct RoSpine<'a> {
    bm: &'a BlockCache,
    validator: Arc<dyn Validator>,
    nodes: Vec<(BlockAddr, ReadHandle<'a>)>,
}

impl<'a> RoSpine<'a> {
    pub fn new(bm: &'a BlockCache, validator: Arc<dyn Validator>) -> Self {
        Self { bm, validator, nodes: Vec::with_capacity(2) }
    }

    /// Step down to `addr`, evicting the oldest held node if already at
    /// the two-lock cap.
    pub fn step(&mut self, addr: BlockAddr) -> Result<(), Error> {
        if self.nodes.len() >= 2 {
            self.nodes.remove(0);
        }
        let handle = self.bm.read_lock(addr, self.validator.clone())?;
        self.nodes.push((addr, handle));
        Ok(())
    }

    pub fn top(&self) -> &ReadHandle<'a> {
        &self.nodes.last().expect("step called before top").1
    }
}

/// Like [`RoSpine`], but descends through a [`TransactionManager`] so a
/// non-blocking clone's reads fail fast with `Error::WouldBlock` instead
/// of parking.
pub struct TmSpine<'a> {
    tm: &'a TransactionManager,
    validator: Arc<dyn Validator>,
    nodes: Vec<(BlockAddr, ReadHandle<'a>)>,
}

impl<'a> TmSpine<'a> {
    pub fn new(tm: &'a TransactionManager, validator: Arc<dyn Validator>) -> Self {
        Self { tm, validator, nodes: Vec::with_capacity(2) }
    }

    pub fn step(&mut self, addr: BlockAddr) -> Result<(), Error> {
        if self.nodes.len() >= 2 {
            self.nodes.remove(0);
        }
        let handle = self.tm.read_lock(addr, self.validator.clone())?;
        self.nodes.push((addr, handle));
        Ok(())
    }

    pub fn top(&self) -> &ReadHandle<'a> {
        &self.nodes.last().expect("step called before top").1
    }
}
