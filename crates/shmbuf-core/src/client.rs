//! Shared memory clients

use crate::segment::ShmSegment;
use crate::types::{SegmentId, WithProtocolId};
use crate::Result;
use std::sync::Arc;

/// Resolves segment ids of one protocol to local mappings
pub trait ShmClient: WithProtocolId + Send + Sync {
    /// Map the segment into this process
    ///
    /// Fails with [`Error::SegmentNotFound`](crate::Error::SegmentNotFound)
    /// when the segment does not exist.
    fn attach(&self, segment: SegmentId) -> Result<Arc<dyn ShmSegment>>;
}
