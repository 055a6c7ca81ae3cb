//! Error types for shmbuf

use crate::types::{ChunkId, ProtocolId, SegmentId};
use thiserror::Error;

/// Allocation failures reported by a backend (or detected by the provider)
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocError {
    /// Enough memory is free but fragmented
    #[error("allocation needs defragmentation")]
    NeedDefragment,

    /// Not enough memory, after defragmentation if the backend supports it
    #[error("out of shared memory")]
    OutOfMemory,

    /// Backend-specific failure
    #[error("backend allocation failure")]
    Other,

    /// The backend broke its allocation contract
    #[error("internal invariant violated by backend")]
    InvariantViolated,
}

/// Layout failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutError {
    /// Zero size, or alignment that is not a power of two
    #[error("incorrect layout arguments")]
    IncorrectLayoutArgs,

    /// Well-formed layout the backend cannot serve
    #[error("layout incompatible with provider")]
    ProviderIncompatibleLayout,
}

/// Failure of the one-shot layout + allocation path
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutAllocError {
    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Layout(#[from] LayoutError),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("shared memory segment already exists: {0}")]
    SegmentExists(String),

    #[error("segment not found: {0:#010x}")]
    SegmentNotFound(SegmentId),

    #[error("chunk out of segment bounds: offset {offset}, len {len}, segment size {size}")]
    ChunkOutOfBounds { offset: usize, len: usize, size: usize },

    #[error("chunk {0} is not mapped by its segment")]
    ChunkNotMapped(ChunkId),

    #[error("no shared memory client for protocol {0}")]
    NoClient(ProtocolId),

    #[error("protocol {0} already has a registered client")]
    DuplicateProtocol(ProtocolId),

    #[error("client registry already in use, clients must be installed first")]
    RegistryFrozen,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Alloc(#[from] AllocError),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
