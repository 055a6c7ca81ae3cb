//! Shared memory provider
//!
//! A provider pairs a backend (to allocate chunks) with the client registry
//! (to map segments of its protocol). Allocation validates the layout, asks
//! the backend for a chunk and, when the backend is out of memory and can
//! defragment, defragments and retries exactly once.

use crate::backend::ShmProviderBackend;
use crate::buffer::{ChunkOwner, ShmMut};
use crate::chunk::{AllocatedChunk, ChunkDescriptor};
use crate::client_storage::{global, MappedSegment, ShmClientStorage};
use crate::context::ThreadSafety;
use crate::error::{AllocError, LayoutAllocError, LayoutError};
use crate::listener::ListenerRegistry;
use crate::types::{ChunkId, MemoryLayout, ProtocolId, SegmentId};
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Result of allocating with a precomputed layout
pub type BufAllocResult = std::result::Result<ShmMut, AllocError>;

/// Result of the one-shot layout + allocation path
pub type BufLayoutAllocResult = std::result::Result<ShmMut, LayoutAllocError>;

/// Events reported to provider listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEvent {
    Allocated(ChunkDescriptor),
    Freed(ChunkDescriptor),
    Defragmented { reclaimed: usize },
    AllocFailed { layout: MemoryLayout, error: AllocError },
}

struct ProviderInner<B> {
    backend: B,
    /// Held around every backend call when the backend is single-threaded
    serial: Option<Mutex<()>>,
    clients: Arc<ShmClientStorage>,
    listeners: ListenerRegistry<ProviderEvent>,
    /// Chunks currently wrapped in a buffer
    outstanding: Mutex<HashSet<(SegmentId, ChunkId)>>,
}

impl<B: ShmProviderBackend> ProviderInner<B> {
    fn dispatch<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        match &self.serial {
            Some(serial) => {
                let _guard = serial.lock();
                f(&self.backend)
            }
            None => f(&self.backend),
        }
    }
}

impl<B: ShmProviderBackend> ChunkOwner for ProviderInner<B> {
    fn release(&self, chunk: &ChunkDescriptor) {
        tracing::trace!(?chunk, "free");
        // Forget before freeing: the backend may hand the id out again at once
        self.outstanding.lock().remove(&(chunk.segment, chunk.chunk));
        self.dispatch(|b| b.free(chunk));
        self.listeners.notify(&ProviderEvent::Freed(*chunk));
    }
}

/// Shared memory provider
///
/// Cheap to clone; clones share the backend. Buffers keep the backend alive
/// until they are released.
pub struct ShmProvider<B> {
    inner: Arc<ProviderInner<B>>,
}

impl<B> Clone for ShmProvider<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: ShmProviderBackend + 'static> ShmProvider<B> {
    pub fn id(&self) -> ProtocolId {
        self.inner.dispatch(|b| b.id())
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Bytes available in the backend, advisory only
    pub fn available(&self) -> usize {
        self.inner.dispatch(|b| b.available())
    }

    /// Defragment the backend explicitly
    pub fn defragment(&self) -> usize {
        let reclaimed = self.inner.dispatch(|b| b.defragment());
        tracing::debug!(reclaimed, "defragmented");
        self.inner
            .listeners
            .notify(&ProviderEvent::Defragmented { reclaimed });
        reclaimed
    }

    /// Listeners notified of allocations, frees and defragmentation
    pub fn listeners(&self) -> &ListenerRegistry<ProviderEvent> {
        &self.inner.listeners
    }

    pub fn client_storage(&self) -> &Arc<ShmClientStorage> {
        &self.inner.clients
    }

    /// Number of chunks currently held by buffers
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.lock().len()
    }

    /// Validate `size` / `align_bytes` once, for repeated allocations
    pub fn alloc_layout(
        &self,
        size: usize,
        align_bytes: usize,
    ) -> std::result::Result<PrecomputedLayout<'_, B>, LayoutError> {
        let layout = MemoryLayout::from_raw(size, align_bytes)?;
        self.precompute(layout)
    }

    /// Same as [`alloc_layout`](Self::alloc_layout) for an already built layout
    pub fn precompute(
        &self,
        layout: MemoryLayout,
    ) -> std::result::Result<PrecomputedLayout<'_, B>, LayoutError> {
        let backend_layout = self.inner.dispatch(|b| b.layout_for(layout))?;
        if backend_layout.size() < layout.size() || backend_layout.alignment() < layout.alignment()
        {
            tracing::error!(
                requested = %layout,
                returned = %backend_layout,
                "backend shrank a layout"
            );
            return Err(LayoutError::ProviderIncompatibleLayout);
        }
        Ok(PrecomputedLayout {
            provider: self,
            layout: backend_layout,
        })
    }

    /// Allocate `size` bytes aligned to `align_bytes`
    pub fn alloc(&self, size: usize, align_bytes: usize) -> BufLayoutAllocResult {
        Ok(self.alloc_layout(size, align_bytes)?.alloc()?)
    }

    /// Map a segment of this provider's protocol
    pub fn resolve(&self, segment: SegmentId) -> Result<Arc<MappedSegment>> {
        self.inner.clients.resolve(self.id(), segment)
    }

    fn alloc_backend_layout(&self, layout: &MemoryLayout) -> BufAllocResult {
        let inner = &self.inner;
        let mut result = inner.dispatch(|b| b.alloc(layout));

        if let Err(AllocError::OutOfMemory | AllocError::NeedDefragment) = result {
            if inner.dispatch(|b| b.supports_defragment()) {
                self.defragment();
                result = inner.dispatch(|b| b.alloc(layout));
            }
        }

        let chunk = match result {
            Ok(chunk) => chunk,
            Err(error) => {
                let error = match error {
                    AllocError::NeedDefragment => AllocError::OutOfMemory,
                    e => e,
                };
                tracing::trace!(%layout, %error, "allocation failed");
                inner.listeners.notify(&ProviderEvent::AllocFailed {
                    layout: *layout,
                    error,
                });
                return Err(error);
            }
        };

        self.wrap(chunk, layout)
    }

    fn wrap(&self, chunk: AllocatedChunk, layout: &MemoryLayout) -> BufAllocResult {
        let AllocatedChunk { descriptor, data } = chunk;
        let inner = &self.inner;
        let key = (descriptor.segment, descriptor.chunk);

        if !inner.outstanding.lock().insert(key) {
            // Not freed: the chunk belongs to the buffer already holding it
            tracing::error!(?descriptor, "backend returned a chunk that is still in use");
            return Err(self.contract_broken(layout));
        }

        if descriptor.len < layout.size()
            || !layout.alignment().is_aligned(data.as_ptr() as usize)
        {
            tracing::error!(
                ?descriptor,
                %layout,
                address = data.as_ptr() as usize,
                "backend returned a chunk that does not satisfy the layout"
            );
            // Still the backend's chunk, but never seen by listeners as allocated
            inner.outstanding.lock().remove(&key);
            inner.dispatch(|b| b.free(&descriptor));
            return Err(self.contract_broken(layout));
        }

        let owner = Arc::clone(inner) as Arc<dyn ChunkOwner>;
        tracing::trace!(?descriptor, "alloc");
        self.inner
            .listeners
            .notify(&ProviderEvent::Allocated(descriptor));
        Ok(ShmMut::new(descriptor, data, owner))
    }

    fn contract_broken(&self, layout: &MemoryLayout) -> AllocError {
        let error = AllocError::InvariantViolated;
        self.inner.listeners.notify(&ProviderEvent::AllocFailed {
            layout: *layout,
            error,
        });
        error
    }
}

impl<B> fmt::Debug for ShmProvider<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmProvider")
            .field("serialized", &self.inner.serial.is_some())
            .field("clients", &self.inner.clients)
            .finish()
    }
}

/// A layout validated and adjusted by a provider's backend
pub struct PrecomputedLayout<'a, B> {
    provider: &'a ShmProvider<B>,
    layout: MemoryLayout,
}

impl<B: ShmProviderBackend + 'static> PrecomputedLayout<'_, B> {
    /// The backend-adjusted layout
    pub fn layout(&self) -> MemoryLayout {
        self.layout
    }

    pub fn alloc(&self) -> BufAllocResult {
        self.provider.alloc_backend_layout(&self.layout)
    }
}

impl<B> fmt::Debug for PrecomputedLayout<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrecomputedLayout")
            .field("layout", &self.layout)
            .finish()
    }
}

/// Builder for [`ShmProvider`]
pub struct ShmProviderBuilder<B> {
    backend: B,
    clients: Option<Arc<ShmClientStorage>>,
}

impl<B: ShmProviderBackend + 'static> ShmProviderBuilder<B> {
    pub fn backend(backend: B) -> Self {
        Self {
            backend,
            clients: None,
        }
    }

    /// Resolve segments through `clients` instead of the process-wide registry
    pub fn with_client_storage(mut self, clients: Arc<ShmClientStorage>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn build(self) -> ShmProvider<B> {
        let serial = match self.backend.thread_safety() {
            ThreadSafety::Serialized => Some(Mutex::new(())),
            ThreadSafety::Concurrent => None,
        };
        let clients = self.clients.unwrap_or_else(global::client_storage);
        tracing::debug!(
            protocol = self.backend.id(),
            serialized = serial.is_some(),
            "shm provider built"
        );

        ShmProvider {
            inner: Arc::new(ProviderInner {
                backend: self.backend,
                serial,
                clients,
                listeners: ListenerRegistry::new(),
                outstanding: Mutex::new(HashSet::new()),
            }),
        }
    }
}

