//! Client registry and segment mappings
//!
//! Clients are keyed by protocol id. Mappings are shared: resolving the
//! same `(protocol, segment)` twice while the first mapping is alive returns
//! the same [`MappedSegment`], and the segment is unmapped when its last
//! reference is dropped.

use crate::buffer::{ChunkOwner, ShmBuf, ShmMut};
use crate::chunk::ChunkDescriptor;
use crate::client::ShmClient;
use crate::posix::PosixShmClient;
use crate::segment::ShmSegment;
use crate::types::{ChunkId, ProtocolId, SegmentId};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

type MappingKey = (ProtocolId, SegmentId);

#[derive(Default)]
struct MappingTable {
    live: Mutex<HashMap<MappingKey, Weak<MappedSegment>>>,
}

impl MappingTable {
    fn forget(&self, key: MappingKey) {
        let mut live = self.live.lock();
        // A concurrent resolve may already have replaced the entry
        if live.get(&key).is_some_and(|w| w.strong_count() == 0) {
            live.remove(&key);
        }
    }
}

/// A segment of some protocol mapped into this process
pub struct MappedSegment {
    protocol: ProtocolId,
    id: SegmentId,
    segment: Arc<dyn ShmSegment>,
    table: Weak<MappingTable>,
}

impl MappedSegment {
    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Address of a chunk of `len` bytes within the mapping
    pub fn map(&self, chunk: ChunkId, len: NonZeroUsize) -> Result<NonNull<u8>> {
        self.segment.map(chunk, len)
    }
}

// Buffers over foreign chunks only hold the mapping; the memory itself is
// freed by the process that allocated it
impl ChunkOwner for MappedSegment {
    fn release(&self, _chunk: &ChunkDescriptor) {}

    // The allocating party may still hold the chunk
    fn owns_chunk(&self) -> bool {
        false
    }
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        tracing::debug!(
            protocol = self.protocol,
            segment = self.id,
            "releasing segment mapping"
        );
        if let Some(table) = self.table.upgrade() {
            table.forget((self.protocol, self.id));
        }
    }
}

impl fmt::Debug for MappedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedSegment")
            .field("protocol", &self.protocol)
            .field("id", &self.id)
            .field("segment", &self.segment)
            .finish()
    }
}

/// Registry of shared memory clients
pub struct ShmClientStorage {
    clients: HashMap<ProtocolId, Arc<dyn ShmClient>>,
    mappings: Arc<MappingTable>,
}

impl ShmClientStorage {
    pub fn builder() -> ShmClientStorageBuilder {
        ShmClientStorageBuilder::default()
    }

    /// Client registered for `protocol`
    pub fn client(&self, protocol: ProtocolId) -> Option<&Arc<dyn ShmClient>> {
        self.clients.get(&protocol)
    }

    /// Registered protocol ids, unordered
    pub fn protocols(&self) -> impl Iterator<Item = ProtocolId> + '_ {
        self.clients.keys().copied()
    }

    /// Map a segment, reusing a live mapping when there is one
    pub fn resolve(&self, protocol: ProtocolId, segment: SegmentId) -> Result<Arc<MappedSegment>> {
        let key = (protocol, segment);
        let mut live = self.mappings.live.lock();
        if let Some(mapped) = live.get(&key).and_then(Weak::upgrade) {
            return Ok(mapped);
        }

        let client = self.clients.get(&protocol).ok_or(Error::NoClient(protocol))?;
        let attached = client.attach(segment)?;
        tracing::debug!(protocol, segment, "attached segment");

        let mapped = Arc::new(MappedSegment {
            protocol,
            id: segment,
            segment: attached,
            table: Arc::downgrade(&self.mappings),
        });
        live.insert(key, Arc::downgrade(&mapped));
        Ok(mapped)
    }

    /// Read view over a chunk allocated by another party
    pub fn attach_chunk(&self, protocol: ProtocolId, chunk: ChunkDescriptor) -> Result<ShmBuf> {
        let mapped = self.resolve(protocol, chunk.segment)?;
        let data = mapped.map(chunk.chunk, chunk.len)?;
        Ok(ShmMut::new(chunk, data, mapped as Arc<dyn ChunkOwner>).freeze())
    }

    /// Number of segments currently mapped through this registry
    pub fn mapping_count(&self) -> usize {
        self.mappings
            .live
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl fmt::Debug for ShmClientStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut protocols: Vec<_> = self.protocols().collect();
        protocols.sort_unstable();
        f.debug_struct("ShmClientStorage")
            .field("protocols", &protocols)
            .field("mappings", &self.mapping_count())
            .finish()
    }
}

/// Builder for [`ShmClientStorage`]
#[derive(Default)]
pub struct ShmClientStorageBuilder {
    clients: HashMap<ProtocolId, Arc<dyn ShmClient>>,
}

impl ShmClientStorageBuilder {
    /// Register a client
    ///
    /// Protocol ids are unique only by convention. If one is already taken,
    /// the new client replaces the old one. Use
    /// [`try_with_client`](Self::try_with_client) to reject that instead.
    pub fn with_client(mut self, client: Arc<dyn ShmClient>) -> Self {
        let protocol = client.id();
        if self.clients.insert(protocol, client).is_some() {
            tracing::warn!(protocol, "protocol id registered twice, last client wins");
        }
        self
    }

    /// Register a client, failing if its protocol id is taken
    pub fn try_with_client(mut self, client: Arc<dyn ShmClient>) -> Result<Self> {
        let protocol = client.id();
        if self.clients.contains_key(&protocol) {
            return Err(Error::DuplicateProtocol(protocol));
        }
        self.clients.insert(protocol, client);
        Ok(self)
    }

    /// Register the bundled POSIX client
    pub fn with_default_clients(self) -> Self {
        self.with_client(Arc::new(PosixShmClient::default()))
    }

    pub fn build(self) -> ShmClientStorage {
        ShmClientStorage {
            clients: self.clients,
            mappings: Arc::default(),
        }
    }
}

/// Process-wide client registry
///
/// Clients are installed before the registry is first used; after that it
/// is frozen.
pub mod global {
    use super::{ShmClientStorage, ShmClientStorageBuilder};
    use crate::client::ShmClient;
    use crate::{Error, Result};
    use parking_lot::{const_mutex, Mutex};
    use std::sync::{Arc, OnceLock};

    struct Pending {
        clients: Vec<Arc<dyn ShmClient>>,
        frozen: bool,
    }

    static PENDING: Mutex<Pending> = const_mutex(Pending {
        clients: Vec::new(),
        frozen: false,
    });
    static STORAGE: OnceLock<Arc<ShmClientStorage>> = OnceLock::new();

    /// Install a client for every provider and consumer in this process
    pub fn install_client(client: Arc<dyn ShmClient>) -> Result<()> {
        let mut pending = PENDING.lock();
        if pending.frozen {
            return Err(Error::RegistryFrozen);
        }
        pending.clients.push(client);
        Ok(())
    }

    /// The process-wide registry: bundled clients plus installed ones
    pub fn client_storage() -> Arc<ShmClientStorage> {
        STORAGE
            .get_or_init(|| {
                let mut pending = PENDING.lock();
                pending.frozen = true;
                let builder = pending
                    .clients
                    .drain(..)
                    .fold(ShmClientStorageBuilder::default().with_default_clients(), |b, c| {
                        b.with_client(c)
                    });
                Arc::new(builder.build())
            })
            .clone()
    }
}
