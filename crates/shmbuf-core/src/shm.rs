//! POSIX shared memory wrapper

use crate::{Error, Result};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::fmt;

/// Shared memory region wrapper
///
/// The creating side owns the OS object and unlinks it on drop.
pub struct SharedMemory {
    inner: Shmem,
    name: String,
    size: usize,
}

// Safety: the mapping is plain memory valid for the lifetime of `inner`;
// concurrent access is coordinated by the buffer handles built on top
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new shared memory region
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| match e {
                ShmemError::MappingIdExists | ShmemError::LinkExists => {
                    Error::SegmentExists(name.to_string())
                }
                e => Error::SharedMemory(e.to_string()),
            })?;

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    /// Open an existing shared memory region
    pub fn open(name: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| Error::SharedMemory(e.to_string()))?;

        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    /// Get the name of the shared memory region
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of the shared memory region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this process created (and will unlink) the region
    pub fn is_owner(&self) -> bool {
        self.inner.is_owner()
    }

    /// Get a raw pointer to the shared memory
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.as_ptr()
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.is_owner())
            .finish()
    }
}
