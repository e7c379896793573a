use thiserror::Error;

/// Errors surfaced by the block cache.
///
/// A checksum or self-address failure is reported distinctly from a plain
/// I/O error because callers (the transaction manager, in particular) must
/// treat it as fatal for the current transaction rather than retry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    #[error("opening the backing device failed")]
    Open(#[source] std::io::Error),
    #[error("failed to lock the backing device for exclusive use")]
    Lock(#[source] std::io::Error),
    #[error("synchronizing the backing device failed")]
    Sync(#[source] std::io::Error),
    #[error("can't resize backing device: have {have} blocks, wanted {want}")]
    Resize { have: u64, want: u64 },
    #[error("block {block} is outside the device (which has {nr_blocks} blocks)")]
    OutOfRange { block: u64, nr_blocks: u64 },
    #[error("checksum mismatch reading block {block}")]
    ChecksumMismatch { block: u64 },
    #[error("block {block} does not self-identify as {block} (found {found})")]
    SelfAddressMismatch { block: u64, found: u64 },
    #[error("lock on block {block} would block")]
    WouldBlock { block: u64 },
    #[error("memory map allocation failed")]
    Map(#[source] std::io::Error),
    #[error("{0}")]
    Other(&'static str),
}

pub type Result<T> = std::result::Result<T, CacheError>;
