//! Leaf value types: the `{size, copy, del, equal}` record spec.md section
//! 4.4's Design Notes calls for, so a tree can be told how to maintain
//! reference counts on values that are themselves block addresses (child
//! subtree roots, in a multi-level tree) without the tree's own code
//! needing to know what a value means.

use crate::{BlockAddr, Error, Shadow};

pub trait ValueType {
    fn size(&self) -> usize;
    /// Called when a value is duplicated into a second place (a node
    /// holding it got shadowed with refcount > 1, or a multi-level tree's
    /// root is rewritten above it). No-op unless the value is itself a
    /// block address needing its own refcount bumped.
    fn copy(&self, value: &[u8], shadow: &mut dyn Shadow) -> Result<(), Error>;
    /// Called when a value is removed from the tree for good.
    fn del(&self, value: &[u8], shadow: &mut dyn Shadow) -> Result<(), Error>;
    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }
}

/// An opaque fixed-width payload with no block-address semantics: used for
/// leaf-level mappings whose value is plain data (HSM `pblock | flags`
/// packing, refcount overflow counts).
pub struct OpaqueValue {
    pub size: usize,
}

impl ValueType for OpaqueValue {
    fn size(&self) -> usize {
        self.size
    }
    fn copy(&self, _value: &[u8], _shadow: &mut dyn Shadow) -> Result<(), Error> {
        Ok(())
    }
    fn del(&self, _value: &[u8], _shadow: &mut dyn Shadow) -> Result<(), Error> {
        Ok(())
    }
}

/// A value that is itself a block address of a subtree root: used for the
/// non-bottom levels of a multi-level tree (spec.md 4.4's `levels=N`
/// trees, keyed level by level).
pub struct ChildRootValue;

impl ValueType for ChildRootValue {
    fn size(&self) -> usize {
        8
    }
    fn copy(&self, value: &[u8], shadow: &mut dyn Shadow) -> Result<(), Error> {
        shadow.inc(read_addr(value))
    }
    fn del(&self, value: &[u8], shadow: &mut dyn Shadow) -> Result<(), Error> {
        shadow.dec(read_addr(value))
    }
}

fn read_addr(value: &[u8]) -> BlockAddr {
    u64::from_le_bytes(value[0..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tm::TransactionManager;
    use block_cache::{BlockCache, CacheOptions};

    fn tm() -> TransactionManager {
        let bm = BlockCache::create_anon(CacheOptions { block_size: 4096, nr_blocks: 64, cache_size: 64 }).unwrap();
        TransactionManager::create(std::sync::Arc::new(bm), 64).unwrap()
    }

    #[test]
    fn copy_increments_and_del_decrements_the_referenced_block() {
        let mut tm = tm();
        let child = tm.new_block(crate::btree::tree::validator()).map(|h| h.block()).unwrap();
        assert_eq!(tm.ref_count(child).unwrap(), 1);

        let bytes = child.to_le_bytes();
        ChildRootValue.copy(&bytes, &mut tm).unwrap();
        assert_eq!(tm.ref_count(child).unwrap(), 2);

        ChildRootValue.del(&bytes, &mut tm).unwrap();
        assert_eq!(tm.ref_count(child).unwrap(), 1);
    }
}
