//! Scripted in-memory backend shared by the integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use shmbuf_core::{
    AllocAlignment, AllocError, AllocatedChunk, ChunkAllocResult, ChunkDescriptor, ChunkId,
    LayoutError, MemoryLayout, ProtocolId, ShmClientStorage, ShmProvider, ShmProviderBackend,
    ShmProviderBuilder, ThreadSafety, WithProtocolId,
};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

pub const SCRIPTED_PROTOCOL_ID: ProtocolId = 0x7e57;
pub const SCRIPTED_SEGMENT: u32 = 1;
pub const PAGE: usize = 4096;

#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct Page([u8; PAGE]);

/// Call counters, shared so they outlive the provider
#[derive(Debug, Default)]
pub struct Stats {
    pub alloc_calls: AtomicUsize,
    pub free_calls: AtomicUsize,
    pub defrag_calls: AtomicUsize,
    pub layout_calls: AtomicUsize,
    /// Frees of chunks that were not live
    pub bad_frees: AtomicUsize,
    /// Backend calls that started while another was running
    pub overlaps: AtomicUsize,
    inside: AtomicUsize,
}

impl Stats {
    pub fn allocs(&self) -> usize {
        self.alloc_calls.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.free_calls.load(Ordering::SeqCst)
    }

    pub fn defrags(&self) -> usize {
        self.defrag_calls.load(Ordering::SeqCst)
    }

    pub fn layouts(&self) -> usize {
        self.layout_calls.load(Ordering::SeqCst)
    }

    /// Every counter that touches the backend
    pub fn backend_calls(&self) -> usize {
        self.allocs() + self.frees() + self.defrags() + self.layouts()
    }
}

struct Section<'a>(&'a Stats);

impl<'a> Section<'a> {
    fn enter(stats: &'a Stats) -> Self {
        if stats.inside.fetch_add(1, Ordering::SeqCst) != 0 {
            stats.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        thread::yield_now();
        Self(stats)
    }
}

impl Drop for Section<'_> {
    fn drop(&mut self) {
        self.0.inside.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct State {
    next: usize,
    live: HashMap<ChunkId, usize>,
    script: VecDeque<AllocError>,
}

/// Bump allocator over heap pages with scripted failures
pub struct ScriptedBackend {
    _memory: Box<[Page]>,
    base: NonNull<u8>,
    capacity: usize,
    granularity: AllocAlignment,
    defragment: bool,
    thread_safety: ThreadSafety,
    short_chunks: bool,
    reuse_chunks: bool,
    state: Mutex<State>,
    stats: Arc<Stats>,
}

// Safety: `base` points into `_memory`, which lives as long as the backend
unsafe impl Send for ScriptedBackend {}
unsafe impl Sync for ScriptedBackend {}

impl ScriptedBackend {
    pub fn new(pages: usize) -> Self {
        let mut memory = vec![Page([0; PAGE]); pages].into_boxed_slice();
        let base = NonNull::new(memory.as_mut_ptr() as *mut u8).unwrap();
        Self {
            _memory: memory,
            base,
            capacity: pages * PAGE,
            granularity: AllocAlignment::ALIGN_1,
            defragment: false,
            thread_safety: ThreadSafety::Concurrent,
            short_chunks: false,
            reuse_chunks: false,
            state: Mutex::new(State::default()),
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn with_defragment(mut self) -> Self {
        self.defragment = true;
        self
    }

    pub fn with_granularity(mut self, granularity: AllocAlignment) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn serialized(mut self) -> Self {
        self.thread_safety = ThreadSafety::Serialized;
        self
    }

    /// Hand out chunks one byte shorter than requested
    pub fn short_chunks(mut self) -> Self {
        self.short_chunks = true;
        self
    }

    /// Hand out offset 0 every time, even while it is live
    pub fn reuse_chunks(mut self) -> Self {
        self.reuse_chunks = true;
        self
    }

    /// Fail the next allocations with `errors`, in order
    pub fn script(&self, errors: impl IntoIterator<Item = AllocError>) {
        self.state.lock().script.extend(errors);
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub fn live(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl WithProtocolId for ScriptedBackend {
    fn id(&self) -> ProtocolId {
        SCRIPTED_PROTOCOL_ID
    }
}

impl ShmProviderBackend for ScriptedBackend {
    fn alloc(&self, layout: &MemoryLayout) -> ChunkAllocResult {
        let _section = Section::enter(&self.stats);
        self.stats.alloc_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if let Some(error) = state.script.pop_front() {
            return Err(error);
        }

        let align = layout.alignment().bytes();
        let size = layout.size().get();
        let next = if self.reuse_chunks { 0 } else { state.next };
        let start = (next + align - 1) & !(align - 1);
        if start + size > self.capacity {
            return Err(AllocError::OutOfMemory);
        }
        state.next = start + size;
        state.live.insert(start as ChunkId, size);

        let len = if self.short_chunks {
            NonZeroUsize::new(size - 1).unwrap_or(layout.size())
        } else {
            layout.size()
        };
        let data = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) };
        Ok(AllocatedChunk::new(
            ChunkDescriptor::new(SCRIPTED_SEGMENT, start as ChunkId, len),
            data,
        ))
    }

    fn free(&self, chunk: &ChunkDescriptor) {
        let _section = Section::enter(&self.stats);
        self.stats.free_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.lock().live.remove(&chunk.chunk).is_none() {
            self.stats.bad_frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn defragment(&self) -> usize {
        let _section = Section::enter(&self.stats);
        self.stats.defrag_calls.fetch_add(1, Ordering::SeqCst);

        // Reclaim the free tail behind the last live chunk
        let mut state = self.state.lock();
        let end = state
            .live
            .iter()
            .map(|(&offset, &len)| offset as usize + len)
            .max()
            .unwrap_or(0);
        let reclaimed = state.next - end;
        state.next = end;
        reclaimed
    }

    fn available(&self) -> usize {
        self.capacity - self.state.lock().next
    }

    fn layout_for(&self, layout: MemoryLayout) -> Result<MemoryLayout, LayoutError> {
        self.stats.layout_calls.fetch_add(1, Ordering::SeqCst);
        let alignment = layout.alignment().max(self.granularity);
        if alignment.bytes() > PAGE {
            return Err(LayoutError::ProviderIncompatibleLayout);
        }
        let size = alignment
            .align_size(layout.size())
            .ok_or(LayoutError::ProviderIncompatibleLayout)?;
        MemoryLayout::new(size.get(), alignment)
    }

    fn supports_defragment(&self) -> bool {
        self.defragment
    }

    fn thread_safety(&self) -> ThreadSafety {
        self.thread_safety
    }
}

/// Provider over `backend` with a private, empty client registry
pub fn provider<B: ShmProviderBackend + 'static>(backend: B) -> ShmProvider<B> {
    ShmProviderBuilder::backend(backend)
        .with_client_storage(Arc::new(ShmClientStorage::builder().build()))
        .build()
}

/// Install a subscriber once so `RUST_LOG` works in tests
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
