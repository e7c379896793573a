//! `dm-hsm`: the metadata and policy core of a hierarchical-storage-cache
//! device-mapper target. This crate builds the target-facing layer
//! ([`metadata`], [`policy`], [`bio`], [`cache_block`], [`copier`],
//! [`target`]) over [`persist_tree`]'s shadowing B-tree and space map and
//! [`block_cache`]'s validated block cache, the way `dm-hsm.c` sits on top
//! of `dm-persistent-data` in the kernel tree this was distilled from.

pub mod bio;
pub mod cache_block;
pub mod copier;
pub mod error;
pub mod metadata;
pub mod policy;
pub mod superblock;
pub mod target;

pub use error::HsmError;
pub use metadata::{HandleRegistry, Metadata};
pub use target::{HsmTarget, TargetArgs};
