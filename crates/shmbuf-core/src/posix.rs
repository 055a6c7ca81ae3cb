//! POSIX shared memory backend and client
//!
//! A backend owns one segment: a header page followed by the data area.
//! Chunk ids are byte offsets into the data area, so any process that knows
//! the segment prefix can map a chunk from its descriptor alone.

use crate::backend::ShmProviderBackend;
use crate::chunk::{AllocatedChunk, ChunkAllocResult, ChunkDescriptor};
use crate::client::ShmClient;
use crate::config::{PosixShmConfig, DEFAULT_SEGMENT_PREFIX, MAX_ALIGNMENT_POW};
use crate::error::{AllocError, LayoutError};
use crate::free_list::FreeList;
use crate::segment::ShmSegment;
use crate::shm::SharedMemory;
use crate::types::{AllocAlignment, ChunkId, MemoryLayout, ProtocolId, SegmentId, WithProtocolId};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Protocol id of the bundled POSIX implementation
pub const POSIX_PROTOCOL_ID: ProtocolId = 0;

/// Header at the start of every segment
#[repr(C)]
struct SegmentHeader {
    /// Magic number for validation
    magic: u32,
    /// Version number
    version: u32,
    /// Id the segment was created under
    segment_id: u32,
    _reserved: u32,
    /// Size of the data area
    data_len: u64,
}

const MAGIC: u32 = 0x53484D42; // "SHMB"
const VERSION: u32 = 1;

/// The header takes a whole page so the data area stays page aligned
const HEADER_SIZE: usize = 1 << MAX_ALIGNMENT_POW;

const CREATE_ATTEMPTS: usize = 16;

static NEXT_SEGMENT: AtomicU32 = AtomicU32::new(0);

fn candidate_segment_id() -> SegmentId {
    std::process::id().rotate_left(16) ^ NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed)
}

fn os_id(prefix: &str, id: SegmentId) -> String {
    format!("/{}_{:08x}", prefix, id)
}

/// A POSIX segment mapped into this process
#[derive(Debug)]
pub struct PosixSegment {
    shm: SharedMemory,
    id: SegmentId,
    data_len: usize,
}

impl PosixSegment {
    /// Create a segment with `data_len` usable bytes under a fresh id
    pub fn create(prefix: &str, data_len: usize) -> Result<Self> {
        for _ in 0..CREATE_ATTEMPTS {
            let id = candidate_segment_id();
            let shm = match SharedMemory::create(&os_id(prefix, id), HEADER_SIZE + data_len) {
                Ok(shm) => shm,
                Err(Error::SegmentExists(name)) => {
                    tracing::debug!(%name, "segment id taken, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Safety: fresh mapping, page aligned and at least HEADER_SIZE long
            unsafe {
                (shm.as_ptr() as *mut SegmentHeader).write(SegmentHeader {
                    magic: MAGIC,
                    version: VERSION,
                    segment_id: id,
                    _reserved: 0,
                    data_len: data_len as u64,
                });
            }
            tracing::debug!(segment = id, name = shm.name(), data_len, "created segment");
            return Ok(Self { shm, id, data_len });
        }

        Err(Error::SharedMemory(format!(
            "no free segment id after {} attempts",
            CREATE_ATTEMPTS
        )))
    }

    /// Map an existing segment
    pub fn open(prefix: &str, id: SegmentId) -> Result<Self> {
        let shm = SharedMemory::open(&os_id(prefix, id)).map_err(|e| {
            tracing::debug!(segment = id, error = %e, "cannot open segment");
            Error::SegmentNotFound(id)
        })?;

        if shm.size() < HEADER_SIZE {
            return Err(Error::SharedMemory(format!(
                "segment {:#010x} too small: {} bytes",
                id,
                shm.size()
            )));
        }

        // Validate header
        let header = unsafe { &*(shm.as_ptr() as *const SegmentHeader) };
        if header.magic != MAGIC {
            return Err(Error::SharedMemory("invalid magic number".to_string()));
        }
        if header.version != VERSION {
            return Err(Error::SharedMemory(format!(
                "version mismatch: expected {}, got {}",
                VERSION, header.version
            )));
        }
        if header.segment_id != id {
            return Err(Error::SharedMemory(format!(
                "segment id mismatch: expected {:#010x}, got {:#010x}",
                id, header.segment_id
            )));
        }
        let data_len = header.data_len as usize;
        if HEADER_SIZE + data_len > shm.size() {
            return Err(Error::SharedMemory(format!(
                "segment {:#010x} truncated: header claims {} data bytes",
                id, data_len
            )));
        }

        Ok(Self { shm, id, data_len })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Size of the data area
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// OS name of the segment
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.shm.as_ptr().add(HEADER_SIZE) }
    }
}

impl ShmSegment for PosixSegment {
    fn map(&self, chunk: ChunkId, len: NonZeroUsize) -> Result<NonNull<u8>> {
        let offset = chunk as usize;
        if !offset
            .checked_add(len.get())
            .is_some_and(|end| end <= self.data_len)
        {
            return Err(Error::ChunkOutOfBounds {
                offset,
                len: len.get(),
                size: self.data_len,
            });
        }
        NonNull::new(unsafe { self.data_ptr().add(offset) }).ok_or(Error::ChunkNotMapped(chunk))
    }
}

/// Backend allocating chunks from a single POSIX segment
#[derive(Debug)]
pub struct PosixShmProviderBackend {
    segment: PosixSegment,
    alignment: AllocAlignment,
    allocator: Mutex<FreeList>,
}

impl PosixShmProviderBackend {
    /// Create the backend and its segment
    pub fn new(config: &PosixShmConfig) -> Result<Self> {
        config.validate()?;
        let alignment = config.alignment()?;
        let segment = PosixSegment::create(&config.segment_prefix, config.size)?;
        tracing::info!(
            segment = segment.id(),
            size = config.size,
            alignment = alignment.bytes(),
            "posix shm backend ready"
        );

        Ok(Self {
            allocator: Mutex::new(FreeList::new(segment.data_len())),
            segment,
            alignment,
        })
    }

    /// Backend with default settings and `size` usable bytes
    pub fn with_size(size: usize) -> Result<Self> {
        Self::new(&PosixShmConfig::new().with_size(size))
    }

    pub fn segment(&self) -> &PosixSegment {
        &self.segment
    }
}

impl WithProtocolId for PosixShmProviderBackend {
    fn id(&self) -> ProtocolId {
        POSIX_PROTOCOL_ID
    }
}

impl ShmProviderBackend for PosixShmProviderBackend {
    fn alloc(&self, layout: &MemoryLayout) -> ChunkAllocResult {
        let offset = self
            .allocator
            .lock()
            .alloc(layout.size().get(), layout.alignment().bytes())?;
        let data = self.segment.map(offset as ChunkId, layout.size()).map_err(|e| {
            tracing::error!(offset, error = %e, "allocated offset outside segment");
            AllocError::Other
        })?;

        Ok(AllocatedChunk::new(
            ChunkDescriptor::new(self.segment.id(), offset as ChunkId, layout.size()),
            data,
        ))
    }

    fn free(&self, chunk: &ChunkDescriptor) {
        if chunk.segment != self.segment.id() {
            tracing::error!(?chunk, segment = self.segment.id(), "free of chunk from another segment");
            return;
        }
        if self.allocator.lock().free(chunk.chunk as usize).is_none() {
            tracing::error!(?chunk, "free of unknown chunk, possible double free");
        }
    }

    fn defragment(&self) -> usize {
        let mut allocator = self.allocator.lock();
        let reclaimed = allocator.defragment();
        tracing::debug!(
            reclaimed,
            largest_free = allocator.largest_free(),
            "defragmented segment"
        );
        reclaimed
    }

    fn available(&self) -> usize {
        self.allocator.lock().available()
    }

    fn layout_for(&self, layout: MemoryLayout) -> std::result::Result<MemoryLayout, LayoutError> {
        if layout.alignment().pow() > MAX_ALIGNMENT_POW {
            return Err(LayoutError::ProviderIncompatibleLayout);
        }
        let alignment = layout.alignment().max(self.alignment);
        let size = alignment
            .align_size(layout.size())
            .filter(|size| size.get() <= self.segment.data_len())
            .ok_or(LayoutError::ProviderIncompatibleLayout)?;
        MemoryLayout::new(size.get(), alignment).map_err(|_| LayoutError::ProviderIncompatibleLayout)
    }

    fn supports_defragment(&self) -> bool {
        true
    }
}

/// Client mapping POSIX segments created by other processes
#[derive(Debug, Clone)]
pub struct PosixShmClient {
    prefix: String,
}

impl PosixShmClient {
    /// Client for segments created under `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for PosixShmClient {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_PREFIX)
    }
}

impl WithProtocolId for PosixShmClient {
    fn id(&self) -> ProtocolId {
        POSIX_PROTOCOL_ID
    }
}

impl ShmClient for PosixShmClient {
    fn attach(&self, segment: SegmentId) -> Result<Arc<dyn ShmSegment>> {
        Ok(Arc::new(PosixSegment::open(&self.prefix, segment)?))
    }
}
