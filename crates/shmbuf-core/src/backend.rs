//! Provider backend contract

use crate::chunk::{ChunkAllocResult, ChunkDescriptor};
use crate::context::ThreadSafety;
use crate::error::LayoutError;
use crate::types::{MemoryLayout, WithProtocolId};

/// Allocation strategy behind a [`ShmProvider`](crate::ShmProvider)
///
/// Implement this to plug a new kind of shared memory into the subsystem.
/// The backend shares its protocol id with the client that maps its
/// segments in other processes.
pub trait ShmProviderBackend: WithProtocolId + Send + Sync {
    /// Carve out a chunk for `layout`.
    /// On success the chunk is at least `layout.size()` bytes and aligned.
    fn alloc(&self, layout: &MemoryLayout) -> ChunkAllocResult;

    /// Give a chunk back.
    /// Called at most once per chunk returned from `alloc`.
    fn free(&self, chunk: &ChunkDescriptor);

    /// Best-effort compaction, returns the number of bytes reclaimed
    fn defragment(&self) -> usize;

    /// Bytes available, advisory only
    fn available(&self) -> usize;

    /// Validate `layout` and adjust it to this backend's granularity
    fn layout_for(&self, layout: MemoryLayout) -> Result<MemoryLayout, LayoutError>;

    /// Whether `defragment` can help a failed allocation
    fn supports_defragment(&self) -> bool {
        false
    }

    /// Whether calls may be dispatched concurrently
    fn thread_safety(&self) -> ThreadSafety {
        ThreadSafety::Concurrent
    }
}
