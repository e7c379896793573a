//! Shadowing B-tree, two-level space map, and transaction manager: the
//! on-disk structures of a persistent, transactional, copy-on-write
//! key-value store built on a block device.
//!
//! This crate deliberately carries a lighter dependency footprint than its
//! sibling `block-cache` crate (no `thiserror`, a hand-rolled `Error`
//! enum) the way the teacher's own inner workspace member does for its
//! lowest-level crate.

use std::fmt;

pub mod btree;
pub mod space_map;
pub mod tm;

pub type BlockAddr = u64;

/// Errors produced while manipulating the on-disk structures.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The device has no more free blocks to hand out.
    NoSpace,
    /// A non-blocking lock attempt would have had to wait.
    WouldBlock,
    /// The requested key was not present.
    NotFound,
    /// On-disk structure failed to validate (checksum, self-address, magic).
    Corruption(&'static str),
    /// Caller passed something the API can't accept.
    InvalidArgument(&'static str),
    /// Too many block operations piled up while the space map was
    /// recursing into its own metadata (see `MAX_RECURSIVE_ALLOCATIONS`).
    TooManyPendingOps,
    /// I/O error from the underlying block cache.
    Io(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoSpace => write!(f, "no space left on device"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::NotFound => write!(f, "key not found"),
            Error::Corruption(s) => write!(f, "on-disk corruption: {s}"),
            Error::InvalidArgument(s) => write!(f, "invalid argument: {s}"),
            Error::TooManyPendingOps => write!(f, "too many pending space map operations"),
            Error::Io(s) => write!(f, "I/O error: {s}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<block_cache::CacheError> for Error {
    fn from(e: block_cache::CacheError) -> Self {
        use block_cache::CacheError as C;
        match e {
            C::ChecksumMismatch { .. } => Error::Corruption("checksum mismatch"),
            C::SelfAddressMismatch { .. } => Error::Corruption("self-address mismatch"),
            C::WouldBlock { .. } => Error::WouldBlock,
            C::OutOfRange { .. } => Error::InvalidArgument("block out of range"),
            other => Error::Io(Box::leak(other.to_string().into_boxed_str())),
        }
    }
}

/// The capability a B-tree descent needs from whatever owns block
/// allocation: allocate, shadow, and adjust reference counts.
///
/// Both the [`tm::TransactionManager`] (for the HSM's own forward/reverse
/// trees) and [`space_map::DiskSpaceMap`] (for its own bitmap-index and
/// overflow ref-count trees) implement this trait. Keeping it as a trait
/// rather than a concrete struct is what lets the space map maintain its
/// own persistent trees without owning a `TransactionManager` — breaking
/// the cyclic "space map allocates transaction-managed blocks, the
/// transaction manager allocates through the space map" dependency that
/// would otherwise require shared interior mutability between the two.
pub trait Shadow {
    /// An owned handle to the block cache, cheap to clone, so callers can
    /// decouple further block locking from the borrow of `self` (needed
    /// since locking happens interleaved with further `&mut self` calls
    /// like `new_block`/`inc`/`dec` during a descent).
    fn block_cache(&self) -> &std::sync::Arc<block_cache::BlockCache>;

    /// Allocate a fresh block address. Its content is unspecified until
    /// the caller locks it with `BlockCache::write_lock_zero`.
    fn new_block(&mut self) -> Result<BlockAddr, Error>;

    /// Shadow `orig`: if already shadowed this transaction, return it
    /// unchanged with `inc_children = false`. Otherwise allocate a new
    /// block, copy `orig`'s contents in, decrement `orig`'s refcount, and
    /// return `inc_children = true` iff `orig`'s refcount (before the
    /// decrement) was greater than one.
    fn shadow_block(&mut self, orig: BlockAddr) -> Result<(BlockAddr, bool), Error>;

    fn inc(&mut self, b: BlockAddr) -> Result<(), Error>;
    fn dec(&mut self, b: BlockAddr) -> Result<(), Error>;
}
