//! Mapped shared memory segments

use crate::types::ChunkId;
use crate::Result;
use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// A shared memory segment mapped into this process
///
/// Implementations unmap the region when dropped.
pub trait ShmSegment: Debug + Send + Sync {
    /// Address of a chunk of `len` bytes inside this segment
    ///
    /// Fails with [`Error::ChunkOutOfBounds`](crate::Error::ChunkOutOfBounds)
    /// unless the whole range `chunk..chunk + len` lies in the mapping.
    fn map(&self, chunk: ChunkId, len: NonZeroUsize) -> Result<NonNull<u8>>;
}
