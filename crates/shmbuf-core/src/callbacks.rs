//! Callback-table implementations of the capability traits
//!
//! Each adapter owns an adopted [`SharedContext`] and a table of plain
//! function pointers that receive the context data. Callbacks run under the
//! context's gate, so a single-threaded context serializes them.

use crate::backend::ShmProviderBackend;
use crate::chunk::{ChunkAllocResult, ChunkDescriptor};
use crate::client::ShmClient;
use crate::context::{Context, ContextGate, SharedContext, ThreadSafety};
use crate::error::LayoutError;
use crate::segment::ShmSegment;
use crate::types::{ChunkId, MemoryLayout, ProtocolId, SegmentId, WithProtocolId};
use crate::Result;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;

/// Backend callbacks
pub struct BackendCallbacks<D> {
    pub alloc: fn(&D, &MemoryLayout) -> ChunkAllocResult,
    pub free: fn(&D, &ChunkDescriptor),
    pub defragment: fn(&D) -> usize,
    pub available: fn(&D) -> usize,
    pub layout_for: fn(&D, MemoryLayout) -> std::result::Result<MemoryLayout, LayoutError>,
    pub id: fn(&D) -> ProtocolId,
    /// `None` means defragmentation is not supported
    pub supports_defragment: Option<fn(&D) -> bool>,
}

impl<D> Clone for BackendCallbacks<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for BackendCallbacks<D> {}

/// Backend driven by a callback table
pub struct CallbackBackend<G: ContextGate> {
    context: SharedContext<G>,
    callbacks: BackendCallbacks<G::Data>,
}

impl<G: ContextGate> CallbackBackend<G> {
    /// Adopt `context` and bind it to `callbacks`
    pub fn new(context: Context<G>, callbacks: BackendCallbacks<G::Data>) -> Self {
        Self {
            context: context.adopt(),
            callbacks,
        }
    }

    /// Bind an already adopted context
    pub fn with_shared(context: &SharedContext<G>, callbacks: BackendCallbacks<G::Data>) -> Self {
        Self {
            context: context.clone(),
            callbacks,
        }
    }

    pub fn context(&self) -> &SharedContext<G> {
        &self.context
    }
}

impl<G: ContextGate> WithProtocolId for CallbackBackend<G> {
    fn id(&self) -> ProtocolId {
        self.context.enter(|d| (self.callbacks.id)(d))
    }
}

impl<G: ContextGate> ShmProviderBackend for CallbackBackend<G> {
    fn alloc(&self, layout: &MemoryLayout) -> ChunkAllocResult {
        self.context.enter(|d| (self.callbacks.alloc)(d, layout))
    }

    fn free(&self, chunk: &ChunkDescriptor) {
        self.context.enter(|d| (self.callbacks.free)(d, chunk))
    }

    fn defragment(&self) -> usize {
        self.context.enter(|d| (self.callbacks.defragment)(d))
    }

    fn available(&self) -> usize {
        self.context.enter(|d| (self.callbacks.available)(d))
    }

    fn layout_for(&self, layout: MemoryLayout) -> std::result::Result<MemoryLayout, LayoutError> {
        self.context.enter(|d| (self.callbacks.layout_for)(d, layout))
    }

    fn supports_defragment(&self) -> bool {
        match self.callbacks.supports_defragment {
            Some(supported) => self.context.enter(|d| supported(d)),
            None => false,
        }
    }

    fn thread_safety(&self) -> ThreadSafety {
        G::THREAD_SAFETY
    }
}

/// Segment callbacks
pub struct SegmentCallbacks<D> {
    /// Address of a chunk of the given length, `None` if the range is not
    /// entirely in this segment
    pub map: fn(&D, ChunkId, NonZeroUsize) -> Option<NonNull<u8>>,
}

impl<D> Clone for SegmentCallbacks<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for SegmentCallbacks<D> {}

/// Segment driven by a callback table
pub struct CallbackSegment<G: ContextGate> {
    id: SegmentId,
    context: SharedContext<G>,
    callbacks: SegmentCallbacks<G::Data>,
}

impl<G: ContextGate> CallbackSegment<G> {
    pub fn new(id: SegmentId, context: Context<G>, callbacks: SegmentCallbacks<G::Data>) -> Self {
        Self {
            id,
            context: context.adopt(),
            callbacks,
        }
    }
}

impl<G: ContextGate> ShmSegment for CallbackSegment<G> {
    fn map(&self, chunk: ChunkId, len: NonZeroUsize) -> Result<NonNull<u8>> {
        self.context
            .enter(|d| (self.callbacks.map)(d, chunk, len))
            .ok_or(crate::Error::ChunkNotMapped(chunk))
    }
}

impl<G: ContextGate> fmt::Debug for CallbackSegment<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSegment")
            .field("id", &self.id)
            .field("context", &self.context)
            .finish()
    }
}

/// Client callbacks
pub struct ClientCallbacks<D> {
    pub attach: fn(&D, SegmentId) -> Result<Arc<dyn ShmSegment>>,
    pub id: fn(&D) -> ProtocolId,
}

impl<D> Clone for ClientCallbacks<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for ClientCallbacks<D> {}

/// Client driven by a callback table
pub struct CallbackClient<G: ContextGate> {
    context: SharedContext<G>,
    callbacks: ClientCallbacks<G::Data>,
}

impl<G: ContextGate> CallbackClient<G> {
    pub fn new(context: Context<G>, callbacks: ClientCallbacks<G::Data>) -> Self {
        Self {
            context: context.adopt(),
            callbacks,
        }
    }

    pub fn with_shared(context: &SharedContext<G>, callbacks: ClientCallbacks<G::Data>) -> Self {
        Self {
            context: context.clone(),
            callbacks,
        }
    }

    pub fn context(&self) -> &SharedContext<G> {
        &self.context
    }
}

impl<G: ContextGate> WithProtocolId for CallbackClient<G> {
    fn id(&self) -> ProtocolId {
        self.context.enter(|d| (self.callbacks.id)(d))
    }
}

impl<G: ContextGate> ShmClient for CallbackClient<G> {
    fn attach(&self, segment: SegmentId) -> Result<Arc<dyn ShmSegment>> {
        self.context.enter(|d| (self.callbacks.attach)(d, segment))
    }
}
