//! Single-level shadowing B-tree operations, and a thin multi-level
//! wrapper that composes them (spec.md section 4.4: "N stacked trees,
//! keyed level-by-level").
//!
//! Insert uses split-before-descend: a full node is split as soon as it's
//! found on the way down, so the caller never has to propagate a split
//! back up. Removal is lookup-then-delete with node collapse (an empty
//! child is unlinked from its parent) but does not redistribute entries
//! across siblings to keep nodes above the `max_entries/3` occupancy
//! threshold — a scope cut documented in DESIGN.md. Both keep to at most
//! two live node locks at a time (parent + child) by dropping the
//! parent's handle before descending.

use std::sync::Arc;

use block_cache::{StandardValidator, Validator};

use crate::btree::node::{NodeRoView, NodeView, BLOCKNR_OFFSET, CSUM_OFFSET};
use crate::btree::spine::{RoSpine, TmSpine};
use crate::tm::TransactionManager;
use crate::btree::value::ValueType;
use crate::{BlockAddr, Error, Shadow};

pub fn validator() -> Arc<dyn Validator> {
    Arc::new(StandardValidator::new(BLOCKNR_OFFSET, CSUM_OFFSET))
}

/// Descriptor for one level of a (possibly multi-level) tree: just the
/// size of the fixed-width leaf value this level stores (internal nodes
/// always carry 8-byte child pointers regardless of leaf value size).
pub struct Tree {
    pub value_size: usize,
}

impl Tree {
    pub fn new(value_size: usize) -> Self {
        Self { value_size }
    }

    /// Create an empty single-level tree, returning its root block.
    pub fn empty(&self, shadow: &mut dyn Shadow) -> Result<BlockAddr, Error> {
        let root = shadow.new_block()?;
        let bm = shadow.block_cache().clone();
        let mut handle = bm.write_lock_zero(root, validator())?;
        let mut node = NodeView::attach(&mut handle, self.value_size);
        node.init(true);
        Ok(root)
    }

    pub fn lookup(
        &self,
        bm: &block_cache::BlockCache,
        root: BlockAddr,
        key: u64,
    ) -> Result<Option<Vec<u8>>, Error> {
        let mut spine = RoSpine::new(bm, validator());
        let mut addr = root;
        loop {
            spine.step(addr)?;
            let handle = spine.top();
            let leaf_probe = NodeRoView::attach(handle, self.value_size).is_leaf();
            let vsize = if leaf_probe { self.value_size } else { 8 };
            let node = NodeRoView::attach(handle, vsize);
            if node.is_leaf() {
                return Ok(match node.search(key) {
                    Ok(i) => Some(node.value(i).to_vec()),
                    Err(_) => None,
                });
            }
            if node.nr_entries() == 0 {
                return Ok(None);
            }
            let i = node.child_index(key);
            addr = u64::from_le_bytes(node.value(i).try_into().unwrap());
        }
    }

    /// Like [`Tree::lookup`], but descends through `tm`'s own
    /// `read_lock` rather than the block cache directly — if `tm` is a
    /// non-blocking clone (spec.md 4.3), a node a writer currently holds
    /// fails the descent with `Error::WouldBlock` instead of waiting.
    pub fn lookup_via_tm(
        &self,
        tm: &TransactionManager,
        root: BlockAddr,
        key: u64,
    ) -> Result<Option<Vec<u8>>, Error> {
        let mut spine = TmSpine::new(tm, validator());
        let mut addr = root;
        loop {
            spine.step(addr)?;
            let handle = spine.top();
            let leaf_probe = NodeRoView::attach(handle, self.value_size).is_leaf();
            let vsize = if leaf_probe { self.value_size } else { 8 };
            let node = NodeRoView::attach(handle, vsize);
            if node.is_leaf() {
                return Ok(match node.search(key) {
                    Ok(i) => Some(node.value(i).to_vec()),
                    Err(_) => None,
                });
            }
            if node.nr_entries() == 0 {
                return Ok(None);
            }
            let i = node.child_index(key);
            addr = u64::from_le_bytes(node.value(i).try_into().unwrap());
        }
    }

    /// Insert `value` under `key`, returning the (possibly new) root and
    /// the value it replaced, if any.
    pub fn insert(
        &self,
        shadow: &mut dyn Shadow,
        root: BlockAddr,
        key: u64,
        value: &[u8],
        value_type: &dyn ValueType,
    ) -> Result<(BlockAddr, Option<Vec<u8>>), Error> {
        let (new_root, split) = self.shadow_node(shadow, root, value_type)?;
        let mut root = new_root;

        // Root split: grow the tree by one level, wrapping the old
        // (now two) roots under a fresh internal root.
        if let Some((sibling_root, sibling_first_key)) = split {
            let new_top = shadow.new_block()?;
            let first_key = self.first_key_of(shadow, root)?;
            let bm = shadow.block_cache().clone();
            let mut h = bm.write_lock_zero(new_top, validator())?;
            let mut node = NodeView::attach(&mut h, 8);
            node.init(false);
            node.insert_at(0, first_key, &root.to_le_bytes());
            node.insert_at(1, sibling_first_key, &sibling_root.to_le_bytes());
            drop(h);
            root = new_top;
        }

        let replaced = self.insert_descend(shadow, root, key, value, value_type)?;
        Ok((root, replaced))
    }

    fn first_key_of(&self, shadow: &mut dyn Shadow, addr: BlockAddr) -> Result<u64, Error> {
        let bm = shadow.block_cache().clone();
        let h = bm.read_lock(addr, validator())?;
        let is_leaf = NodeRoView::attach(&h, self.value_size).is_leaf();
        let vsize = if is_leaf { self.value_size } else { 8 };
        Ok(NodeRoView::attach(&h, vsize).first_key().unwrap_or(0))
    }

    /// Shadow `addr`'s node and, if it was full, split it in place,
    /// returning `(new_self_addr, Some((sibling_addr, sibling_first_key)))`
    /// when a split happened.
    ///
    /// `shadow_block` reports `inc_children = true` when `orig` was shared
    /// (refcount > 1 before the shadow copy) — the copy now has a second
    /// set of live pointers into whatever its entries reference, so each
    /// child needs its own refcount bumped: `shadow.inc` for an internal
    /// node's raw child addresses, `value_type.copy` for a leaf's values
    /// (a no-op for opaque values, a bump for a child subtree root).
    fn shadow_node(
        &self,
        shadow: &mut dyn Shadow,
        addr: BlockAddr,
        value_type: &dyn ValueType,
    ) -> Result<(BlockAddr, Option<(BlockAddr, u64)>), Error> {
        let (new_addr, inc_children) = shadow.shadow_block(addr)?;
        let bm = shadow.block_cache().clone();
        let is_leaf = {
            let h = bm.read_lock(new_addr, validator())?;
            NodeRoView::attach(&h, self.value_size).is_leaf()
        };
        let vsize = if is_leaf { self.value_size } else { 8 };

        if inc_children {
            self.inc_node_children(shadow, new_addr, vsize, is_leaf, value_type)?;
        }

        let full = {
            let h = bm.read_lock(new_addr, validator())?;
            let node = NodeRoView::attach(&h, vsize);
            node.nr_entries() >= node.max_entries()
        };
        if !full {
            return Ok((new_addr, None));
        }

        let sibling = shadow.new_block()?;
        let bm = shadow.block_cache().clone();
        let sibling_first_key;
        {
            let mut h = bm.write_lock(new_addr, validator())?;
            let mut node = NodeView::attach(&mut h, vsize);
            let split_at = node.nr_entries() / 2;
            let mut sib_h = bm.write_lock_zero(sibling, validator())?;
            let mut sib = NodeView::attach(&mut sib_h, vsize);
            sib.init(is_leaf);
            node.move_tail_to(split_at, &mut sib);
            sibling_first_key = sib.first_key().unwrap_or(0);
        }
        Ok((new_addr, Some((sibling, sibling_first_key))))
    }

    /// Bump the refcount of every child a freshly-shadowed, previously
    /// shared node points to: raw child addresses for an internal node,
    /// `value_type.copy` for a leaf's values.
    fn inc_node_children(
        &self,
        shadow: &mut dyn Shadow,
        addr: BlockAddr,
        vsize: usize,
        is_leaf: bool,
        value_type: &dyn ValueType,
    ) -> Result<(), Error> {
        let bm = shadow.block_cache().clone();
        let entries: Vec<Vec<u8>> = {
            let h = bm.read_lock(addr, validator())?;
            let node = NodeRoView::attach(&h, vsize);
            (0..node.nr_entries()).map(|i| node.value(i).to_vec()).collect()
        };
        for value in entries {
            if is_leaf {
                value_type.copy(&value, shadow)?;
            } else {
                shadow.inc(u64::from_le_bytes(value.try_into().unwrap()))?;
            }
        }
        Ok(())
    }

    fn insert_descend(
        &self,
        shadow: &mut dyn Shadow,
        addr: BlockAddr,
        key: u64,
        value: &[u8],
        value_type: &dyn ValueType,
    ) -> Result<Option<Vec<u8>>, Error> {
        let bm = shadow.block_cache().clone();
        let is_leaf = {
            let h = bm.read_lock(addr, validator())?;
            NodeRoView::attach(&h, self.value_size).is_leaf()
        };

        if is_leaf {
            let mut h = bm.write_lock(addr, validator())?;
            let mut node = NodeView::attach(&mut h, self.value_size);
            return Ok(match node.search(key) {
                Ok(i) => {
                    let (_, old) = node.remove_at(i);
                    node.insert_at(i, key, value);
                    Some(old)
                }
                Err(i) => {
                    node.insert_at(i, key, value);
                    None
                }
            });
        }

        // Internal node: find the child, shadow+split it if necessary
        // (updating our own entry for it), then recurse.
        let child_idx = {
            let h = bm.read_lock(addr, validator())?;
            NodeRoView::attach(&h, 8).child_index(key)
        };
        let child_addr = {
            let h = bm.read_lock(addr, validator())?;
            let node = NodeRoView::attach(&h, 8);
            u64::from_le_bytes(node.value(child_idx).try_into().unwrap())
        };

        let (new_child, split) = self.shadow_node(shadow, child_addr, value_type)?;
        let bm = shadow.block_cache().clone();
        {
            let mut h = bm.write_lock(addr, validator())?;
            let mut node = NodeView::attach(&mut h, 8);
            node.set_value_at(child_idx, &new_child.to_le_bytes());
            if let Some((sibling, sibling_key)) = split {
                node.insert_at(child_idx + 1, sibling_key, &sibling.to_le_bytes());
            }
        }

        // Re-resolve which of (possibly now two) children actually owns
        // `key`, then recurse into it.
        let target = {
            let h = bm.read_lock(addr, validator())?;
            let node = NodeRoView::attach(&h, 8);
            let i = node.child_index(key);
            u64::from_le_bytes(node.value(i).try_into().unwrap())
        };
        self.insert_descend(shadow, target, key, value, value_type)
    }

    /// Visit every `(key, value)` leaf entry in ascending key order.
    /// Read-only; used for crash-recovery scans that have no other way to
    /// enumerate a tree's contents (spec.md 4.7's "walks every pool_block
    /// in the reverse map").
    pub fn for_each(&self, bm: &block_cache::BlockCache, root: BlockAddr, f: &mut dyn FnMut(u64, &[u8])) -> Result<(), Error> {
        self.walk(bm, root, f)
    }

    fn walk(&self, bm: &block_cache::BlockCache, addr: BlockAddr, f: &mut dyn FnMut(u64, &[u8])) -> Result<(), Error> {
        let is_leaf = {
            let h = bm.read_lock(addr, validator())?;
            NodeRoView::attach(&h, self.value_size).is_leaf()
        };
        if is_leaf {
            let h = bm.read_lock(addr, validator())?;
            let node = NodeRoView::attach(&h, self.value_size);
            for i in 0..node.nr_entries() {
                f(node.key(i), node.value(i));
            }
            return Ok(());
        }
        let children: Vec<u64> = {
            let h = bm.read_lock(addr, validator())?;
            let node = NodeRoView::attach(&h, 8);
            (0..node.nr_entries()).map(|i| u64::from_le_bytes(node.value(i).try_into().unwrap())).collect()
        };
        for c in children {
            self.walk(bm, c, f)?;
        }
        Ok(())
    }

    pub fn remove(
        &self,
        shadow: &mut dyn Shadow,
        root: BlockAddr,
        key: u64,
        value_type: &dyn ValueType,
    ) -> Result<(BlockAddr, Option<Vec<u8>>), Error> {
        self.remove_descend(shadow, root, key, value_type)
    }

    fn remove_descend(
        &self,
        shadow: &mut dyn Shadow,
        addr: BlockAddr,
        key: u64,
        value_type: &dyn ValueType,
    ) -> Result<(BlockAddr, Option<Vec<u8>>), Error> {
        let (new_addr, inc_children) = shadow.shadow_block(addr)?;
        let bm = shadow.block_cache().clone();
        let is_leaf = {
            let h = bm.read_lock(new_addr, validator())?;
            NodeRoView::attach(&h, self.value_size).is_leaf()
        };
        let vsize = if is_leaf { self.value_size } else { 8 };

        if inc_children {
            self.inc_node_children(shadow, new_addr, vsize, is_leaf, value_type)?;
        }

        if is_leaf {
            let mut h = bm.write_lock(new_addr, validator())?;
            let mut node = NodeView::attach(&mut h, self.value_size);
            return Ok(match node.search(key) {
                Ok(i) => {
                    let (_, old) = node.remove_at(i);
                    drop(h);
                    value_type.del(&old, shadow)?;
                    (new_addr, Some(old))
                }
                Err(_) => (new_addr, None),
            });
        }

        let child_idx = {
            let h = bm.read_lock(new_addr, validator())?;
            NodeRoView::attach(&h, 8).child_index(key)
        };
        let child_addr = {
            let h = bm.read_lock(new_addr, validator())?;
            let node = NodeRoView::attach(&h, 8);
            u64::from_le_bytes(node.value(child_idx).try_into().unwrap())
        };

        let (new_child, removed) = self.remove_descend(shadow, child_addr, key, value_type)?;
        let bm = shadow.block_cache().clone();

        let child_empty = {
            let h = bm.read_lock(new_child, validator())?;
            let is_child_leaf = NodeRoView::attach(&h, self.value_size).is_leaf();
            let vsize = if is_child_leaf { self.value_size } else { 8 };
            NodeRoView::attach(&h, vsize).nr_entries() == 0
        };

        if child_empty {
            let mut h = bm.write_lock(new_addr, validator())?;
            let mut node = NodeView::attach(&mut h, 8);
            if node.nr_entries() > 1 {
                node.remove_at(child_idx);
                drop(h);
                shadow.dec(new_child)?;
            } else {
                node.set_value_at(child_idx, &new_child.to_le_bytes());
            }
        } else {
            let mut h = bm.write_lock(new_addr, validator())?;
            let mut node = NodeView::attach(&mut h, 8);
            node.set_value_at(child_idx, &new_child.to_le_bytes());
        }

        Ok((new_addr, removed))
    }
}
