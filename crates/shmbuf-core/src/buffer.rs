//! Shared memory buffers
//!
//! A chunk is reachable through exactly one of:
//!
//! - [`ShmMut`]: exclusive and writable,
//! - one or more [`ShmBuf`]: shared and read-only, reference counted.
//!
//! `ShmMut::freeze` moves the exclusive handle into the first shared
//! reference. `ShmBuf::try_downgrade` goes back only when no other reference
//! exists. Every terminal transition consumes its handle, and the chunk is
//! handed back to its owner when the last handle is dropped, exactly once.

use crate::chunk::ChunkDescriptor;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;
use thiserror::Error;

/// Whoever gets a chunk back when its last handle is dropped
pub(crate) trait ChunkOwner: Send + Sync {
    fn release(&self, chunk: &ChunkDescriptor);

    /// False when other processes may hold views of the same chunk, which
    /// rules out regaining write access
    fn owns_chunk(&self) -> bool {
        true
    }
}

struct ChunkHandle {
    descriptor: ChunkDescriptor,
    data: NonNull<u8>,
    owner: Arc<dyn ChunkOwner>,
}

// Safety: `data` points into a mapping kept alive by `owner`; exclusive vs
// shared access is enforced by ShmMut / ShmBuf
unsafe impl Send for ChunkHandle {}
unsafe impl Sync for ChunkHandle {}

impl ChunkHandle {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.descriptor.len.get()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.descriptor.len.get()) }
    }
}

impl Drop for ChunkHandle {
    fn drop(&mut self) {
        self.owner.release(&self.descriptor);
    }
}

/// Exclusively owned, writable shared memory buffer
pub struct ShmMut {
    chunk: ChunkHandle,
}

impl ShmMut {
    pub(crate) fn new(
        descriptor: ChunkDescriptor,
        data: NonNull<u8>,
        owner: Arc<dyn ChunkOwner>,
    ) -> Self {
        Self {
            chunk: ChunkHandle {
                descriptor,
                data,
                owner,
            },
        }
    }

    /// Length in bytes (at least the requested size)
    pub fn len(&self) -> usize {
        self.chunk.descriptor.len.get()
    }

    /// Always false: chunks are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn descriptor(&self) -> ChunkDescriptor {
        self.chunk.descriptor
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.chunk.data.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.chunk.data.as_ptr()
    }

    /// Give up exclusive access and make the buffer shareable
    pub fn freeze(self) -> ShmBuf {
        ShmBuf {
            chunk: Arc::new(self.chunk),
        }
    }
}

impl Deref for ShmMut {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.chunk.as_slice()
    }
}

impl DerefMut for ShmMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.chunk.as_mut_slice()
    }
}

impl AsRef<[u8]> for ShmMut {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for ShmMut {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl fmt::Debug for ShmMut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmMut")
            .field("descriptor", &self.chunk.descriptor)
            .finish()
    }
}

/// Shared, read-only shared memory buffer
///
/// Cloning only bumps the reference count.
#[derive(Clone)]
pub struct ShmBuf {
    chunk: Arc<ChunkHandle>,
}

impl ShmBuf {
    pub fn len(&self) -> usize {
        self.chunk.descriptor.len.get()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn descriptor(&self) -> ChunkDescriptor {
        self.chunk.descriptor
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.chunk.data.as_ptr()
    }

    /// Number of live references to this chunk
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.chunk)
    }

    /// Regain exclusive access if this is the only reference
    ///
    /// Buffers attached from another party's chunk always fail. On failure
    /// the buffer is handed back untouched.
    pub fn try_downgrade(self) -> Result<ShmMut, StillShared> {
        if !self.chunk.owner.owns_chunk() {
            return Err(StillShared { buf: self });
        }
        match Arc::try_unwrap(self.chunk) {
            Ok(chunk) => Ok(ShmMut { chunk }),
            Err(chunk) => Err(StillShared {
                buf: ShmBuf { chunk },
            }),
        }
    }
}

impl Deref for ShmBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.chunk.as_slice()
    }
}

impl AsRef<[u8]> for ShmBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl fmt::Debug for ShmBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmBuf")
            .field("descriptor", &self.chunk.descriptor)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// `try_downgrade` found other references
#[derive(Error, Debug)]
#[error("buffer is still shared")]
pub struct StillShared {
    buf: ShmBuf,
}

impl StillShared {
    pub fn buf(&self) -> &ShmBuf {
        &self.buf
    }

    pub fn into_inner(self) -> ShmBuf {
        self.buf
    }
}
