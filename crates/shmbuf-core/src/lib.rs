//! shmbuf - Shared memory allocation and buffer lifetimes
//!
//! A [`ShmProvider`] allocates chunks from a pluggable backend and hands them
//! out as exclusive [`ShmMut`] buffers, which freeze into shared [`ShmBuf`]
//! buffers. Receivers map the same chunks through a [`ShmClientStorage`].

pub mod backend;
pub mod buffer;
pub mod callbacks;
pub mod chunk;
pub mod client;
pub mod client_storage;
pub mod config;
pub mod context;
pub mod error;
mod free_list;
pub mod listener;
pub mod opaque;
pub mod payload;
pub mod posix;
pub mod provider;
pub mod segment;
mod shm;
pub mod types;

pub use backend::ShmProviderBackend;
pub use buffer::{ShmBuf, ShmMut, StillShared};
pub use callbacks::{BackendCallbacks, CallbackBackend, CallbackClient, CallbackSegment, ClientCallbacks, SegmentCallbacks};
pub use chunk::{AllocatedChunk, ChunkAllocResult, ChunkDescriptor};
pub use client::ShmClient;
pub use client_storage::{global, MappedSegment, ShmClientStorage, ShmClientStorageBuilder};
pub use config::PosixShmConfig;
pub use context::{Context, SharedContext, ThreadSafety};
pub use error::{AllocError, Error, LayoutAllocError, LayoutError, Result};
pub use listener::{Listener, ListenerId, ListenerRegistry};
pub use opaque::{OpaqueRecord, OwnedBufAllocResult, OwnedShmBuf, OwnedShmMut};
pub use payload::Payload;
pub use posix::{PosixSegment, PosixShmClient, PosixShmProviderBackend, POSIX_PROTOCOL_ID};
pub use provider::{
    BufAllocResult, BufLayoutAllocResult, PrecomputedLayout, ProviderEvent, ShmProvider,
    ShmProviderBuilder,
};
pub use segment::ShmSegment;
pub use types::{AllocAlignment, ChunkId, MemoryLayout, ProtocolId, SegmentId, WithProtocolId};
