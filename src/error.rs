use thiserror::Error;

/// The error kinds spec.md section 7 lists, unified across the HSM
/// metadata and target layers: `NoSpace, WouldBlock, NotFound, IoError,
/// ChecksumMismatch, SelfAddressMismatch, InvalidSuperblock,
/// InvalidArgument, OutOfMemory`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HsmError {
    #[error("metadata device has no free blocks left")]
    NoSpace,
    #[error("operation would block")]
    WouldBlock,
    #[error("no mapping for the requested block")]
    NotFound,
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
    #[error("checksum mismatch on block {block}")]
    ChecksumMismatch { block: u64 },
    #[error("self-address mismatch on block {block}")]
    SelfAddressMismatch { block: u64 },
    #[error("invalid superblock: {0}")]
    InvalidSuperblock(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("on-disk corruption: {0}")]
    Corruption(&'static str),
    #[error("device already open under this identity")]
    AlreadyOpen,
}

impl From<block_cache::CacheError> for HsmError {
    fn from(e: block_cache::CacheError) -> Self {
        use block_cache::CacheError as C;
        match e {
            C::ChecksumMismatch { block } => HsmError::ChecksumMismatch { block },
            C::SelfAddressMismatch { block, .. } => HsmError::SelfAddressMismatch { block },
            C::WouldBlock { .. } => HsmError::WouldBlock,
            C::OutOfRange { .. } => HsmError::InvalidArgument("block out of range"),
            C::Open(e) | C::Sync(e) | C::Map(e) => HsmError::Io(e),
            C::Lock(_) => HsmError::InvalidArgument("backing device already locked"),
            C::Resize { .. } => HsmError::InvalidArgument("backing device resize failed"),
            C::Other(s) => HsmError::Corruption(s),
            _ => HsmError::InvalidArgument("unrecognized cache error"),
        }
    }
}

impl From<persist_tree::Error> for HsmError {
    fn from(e: persist_tree::Error) -> Self {
        use persist_tree::Error as E;
        match e {
            E::NoSpace => HsmError::NoSpace,
            E::WouldBlock => HsmError::WouldBlock,
            E::NotFound => HsmError::NotFound,
            E::Corruption(s) => HsmError::Corruption(s),
            E::InvalidArgument(s) => HsmError::InvalidArgument(s),
            E::TooManyPendingOps => HsmError::InvalidArgument("space map recursion overflow"),
            E::Io(s) => HsmError::InvalidArgument(s),
            _ => HsmError::InvalidArgument("unrecognized persist-tree error"),
        }
    }
}
