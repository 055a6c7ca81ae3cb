mod common;

use common::init_tracing;
use shmbuf_core::{
    AllocAlignment, AllocError, ChunkDescriptor, Error, LayoutAllocError, Payload, PosixShmClient,
    PosixShmConfig, PosixShmProviderBackend, ShmClientStorage, ShmProvider, ShmProviderBuilder,
    POSIX_PROTOCOL_ID,
};
use std::num::NonZeroUsize;
use std::sync::Arc;

fn prefix(test: &str) -> String {
    format!("shmbuf_t{}_{}", std::process::id(), test)
}

fn posix_provider(test: &str, size: usize) -> ShmProvider<PosixShmProviderBackend> {
    init_tracing();
    let prefix = prefix(test);
    let config = PosixShmConfig::new()
        .with_size(size)
        .with_segment_prefix(prefix.as_str());
    let storage = ShmClientStorage::builder()
        .with_client(Arc::new(PosixShmClient::new(prefix)))
        .build();

    ShmProviderBuilder::backend(PosixShmProviderBackend::new(&config).unwrap())
        .with_client_storage(Arc::new(storage))
        .build()
}

#[test]
fn test_alloc_and_free() {
    let provider = posix_provider("alloc", 4096);
    assert_eq!(provider.id(), POSIX_PROTOCOL_ID);
    assert_eq!(provider.available(), 4096);

    let buf = provider.alloc(100, 8).unwrap();
    // Rounded up to the default 8 byte granularity
    assert_eq!(buf.len(), 104);
    assert_eq!(provider.available(), 4096 - 104);

    drop(buf);
    assert_eq!(provider.available(), 4096);
}

#[test]
fn test_alignment_above_granularity() {
    let provider = posix_provider("align", 8192);
    let _pad = provider.alloc(8, 1).unwrap();
    let buf = provider.alloc(64, 256).unwrap();
    assert_eq!(buf.as_ptr() as usize % 256, 0);
    assert_eq!(buf.descriptor().chunk % 256, 0);

    assert!(matches!(
        provider.alloc(64, 8192),
        Err(LayoutAllocError::Layout(_))
    ));
}

#[test]
fn test_defragment_on_fragmentation() {
    let provider = posix_provider("defrag", 4096);
    let blocks: Vec<_> = (0..4).map(|_| provider.alloc(1024, 8).unwrap()).collect();
    assert!(matches!(
        provider.alloc(8, 8),
        Err(LayoutAllocError::Alloc(AllocError::OutOfMemory))
    ));

    // Free two neighbours: 2048 bytes free, but in two separate blocks
    let mut blocks = blocks.into_iter();
    let first = blocks.next().unwrap();
    drop(blocks.next());
    drop(blocks.next());
    let last = blocks.next().unwrap();

    let merged = provider.alloc(2048, 8).unwrap();
    assert_eq!(merged.len(), 2048);
    drop((first, last, merged));
    assert_eq!(provider.available(), 4096);
}

#[test]
fn test_resolve_maps_same_bytes() {
    let provider = posix_provider("resolve", 4096);
    let mut buf = provider.alloc(32, 8).unwrap();
    buf[..12].copy_from_slice(b"shared bytes");
    let descriptor = buf.descriptor();
    let local = buf.freeze();

    // A second mapping of the same segment sees the same bytes
    let remote = provider
        .client_storage()
        .attach_chunk(POSIX_PROTOCOL_ID, descriptor)
        .unwrap();
    assert_ne!(remote.as_ptr(), local.as_ptr());
    assert_eq!(&remote[..12], b"shared bytes");
    assert_eq!(provider.client_storage().mapping_count(), 1);

    let segment = provider.resolve(descriptor.segment).unwrap();
    assert_eq!(segment.id(), descriptor.segment);
    assert_eq!(provider.client_storage().mapping_count(), 1);

    drop(remote);
    drop(segment);
    assert_eq!(provider.client_storage().mapping_count(), 0);

    let payload = Payload::from(local);
    assert!(payload.is_shm());
    assert_eq!(&payload[..12], b"shared bytes");
}

#[test]
fn test_attach_chunk_rejects_out_of_bounds_len() {
    let provider = posix_provider("bounds", 4096);
    let segment = provider.backend().segment().id();
    let storage = provider.client_storage();
    let len = |n| NonZeroUsize::new(n).unwrap();

    let tail = storage
        .attach_chunk(POSIX_PROTOCOL_ID, ChunkDescriptor::new(segment, 4088, len(8)))
        .unwrap();
    assert_eq!(tail.len(), 8);

    for (offset, n) in [(4000, 1 << 20), (4096, 1), (4089, 8), (0, 4097)] {
        let chunk = ChunkDescriptor::new(segment, offset, len(n));
        let result = storage.attach_chunk(POSIX_PROTOCOL_ID, chunk);
        assert!(
            matches!(result, Err(Error::ChunkOutOfBounds { size: 4096, .. })),
            "offset {} len {}",
            offset,
            n
        );
    }
}

#[test]
fn test_remote_buffer_cannot_downgrade() {
    let provider = posix_provider("downgrade", 4096);
    let mut buf = provider.alloc(16, 8).unwrap();
    buf.copy_from_slice(b"producer-frozen!");
    let local = buf.freeze();

    let remote = provider
        .client_storage()
        .attach_chunk(POSIX_PROTOCOL_ID, local.descriptor())
        .unwrap();
    assert_eq!(remote.ref_count(), 1);
    let remote = remote.try_downgrade().unwrap_err().into_inner();
    assert_eq!(&remote[..], b"producer-frozen!");
    assert_eq!(&local[..], b"producer-frozen!");

    // Dropping the mapping never frees the producer's chunk
    drop(remote);
    assert_eq!(provider.outstanding(), 1);
    assert!(local.try_downgrade().is_ok());
}

#[test]
fn test_unknown_segment() {
    let provider = posix_provider("unknown", 4096);
    let missing = provider.backend().segment().id().wrapping_add(0x1000_0000);
    assert!(matches!(
        provider.resolve(missing),
        Err(Error::SegmentNotFound(id)) if id == missing
    ));
}

#[test]
fn test_config_from_json() {
    let config = PosixShmConfig::from_json(&format!(
        r#"{{"size": 65536, "alignment_pow": 6, "segment_prefix": "{}"}}"#,
        prefix("json")
    ))
    .unwrap();
    assert_eq!(config.alignment().unwrap(), AllocAlignment::new(6).unwrap());

    let backend = PosixShmProviderBackend::new(&config).unwrap();
    assert_eq!(backend.segment().data_len(), 65536);
    let provider = ShmProviderBuilder::backend(backend)
        .with_client_storage(Arc::new(ShmClientStorage::builder().build()))
        .build();
    assert_eq!(provider.alloc(1, 1).unwrap().len(), 64);
}
