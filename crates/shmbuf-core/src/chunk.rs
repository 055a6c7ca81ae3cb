//! Chunk descriptors

use crate::error::AllocError;
use crate::types::{ChunkId, SegmentId};
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Location of a chunk: segment, chunk within it, and length
///
/// A descriptor is plain data and owns nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkDescriptor {
    pub segment: SegmentId,
    pub chunk: ChunkId,
    pub len: NonZeroUsize,
}

impl ChunkDescriptor {
    pub fn new(segment: SegmentId, chunk: ChunkId, len: NonZeroUsize) -> Self {
        Self {
            segment,
            chunk,
            len,
        }
    }
}

/// A chunk freshly carved out by a backend
#[derive(Debug)]
pub struct AllocatedChunk {
    pub descriptor: ChunkDescriptor,
    /// Start of the chunk in the backend's own mapping
    pub data: NonNull<u8>,
}

// Safety: the pointer targets shared memory owned by the backend, which
// outlives every chunk it hands out
unsafe impl Send for AllocatedChunk {}
unsafe impl Sync for AllocatedChunk {}

impl AllocatedChunk {
    pub fn new(descriptor: ChunkDescriptor, data: NonNull<u8>) -> Self {
        Self { descriptor, data }
    }
}

/// Result of a backend allocation
pub type ChunkAllocResult = std::result::Result<AllocatedChunk, AllocError>;
