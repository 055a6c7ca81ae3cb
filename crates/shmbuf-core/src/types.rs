//! Identifiers and allocation layouts

use crate::error::LayoutError;
use std::fmt;
use std::num::NonZeroUsize;

/// Unique protocol identifier.
///
/// Incompatible client and backend implementations must never share a
/// protocol id: segments are routed to clients by this value alone.
pub type ProtocolId = u32;

/// Process-wide segment identifier
pub type SegmentId = u32;

/// Chunk identifier within its segment
pub type ChunkId = u32;

/// Anything bound to a shared memory protocol
pub trait WithProtocolId {
    /// Id of the protocol this implementation speaks
    fn id(&self) -> ProtocolId;
}

/// Power-of-two alignment, stored as its exponent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AllocAlignment {
    pow: u8,
}

impl AllocAlignment {
    /// Largest representable exponent
    pub const MAX_POW: u8 = (usize::BITS - 1) as u8;

    /// Byte alignment
    pub const ALIGN_1: Self = Self { pow: 0 };

    /// Create from an exponent (alignment = 2^pow bytes)
    pub const fn new(pow: u8) -> Result<Self, LayoutError> {
        if pow > Self::MAX_POW {
            return Err(LayoutError::IncorrectLayoutArgs);
        }
        Ok(Self { pow })
    }

    /// Create from a byte count, which must be a non-zero power of two
    pub fn from_bytes(bytes: usize) -> Result<Self, LayoutError> {
        if !bytes.is_power_of_two() {
            return Err(LayoutError::IncorrectLayoutArgs);
        }
        Ok(Self {
            pow: bytes.trailing_zeros() as u8,
        })
    }

    /// Exponent
    pub fn pow(&self) -> u8 {
        self.pow
    }

    /// Alignment in bytes
    pub fn bytes(&self) -> usize {
        1 << self.pow
    }

    /// Round `size` up to a multiple of this alignment, `None` on overflow
    pub fn align_size(&self, size: NonZeroUsize) -> Option<NonZeroUsize> {
        let mask = self.bytes() - 1;
        let rounded = size.get().checked_add(mask)? & !mask;
        NonZeroUsize::new(rounded)
    }

    /// Whether `addr` is a multiple of this alignment
    pub fn is_aligned(&self, addr: usize) -> bool {
        addr & (self.bytes() - 1) == 0
    }
}

impl fmt::Display for AllocAlignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// Requested shape of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryLayout {
    size: NonZeroUsize,
    alignment: AllocAlignment,
}

impl MemoryLayout {
    /// Create a layout, rejecting zero sizes and sizes that overflow once aligned
    pub fn new(size: usize, alignment: AllocAlignment) -> Result<Self, LayoutError> {
        let size = NonZeroUsize::new(size).ok_or(LayoutError::IncorrectLayoutArgs)?;
        alignment
            .align_size(size)
            .ok_or(LayoutError::IncorrectLayoutArgs)?;
        Ok(Self { size, alignment })
    }

    /// Create from a size and an alignment in bytes
    pub fn from_raw(size: usize, align_bytes: usize) -> Result<Self, LayoutError> {
        Self::new(size, AllocAlignment::from_bytes(align_bytes)?)
    }

    pub fn size(&self) -> NonZeroUsize {
        self.size
    }

    pub fn alignment(&self) -> AllocAlignment {
        self.alignment
    }
}

impl fmt::Display for MemoryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes (align {})", self.size, self.alignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_from_bytes() {
        assert_eq!(AllocAlignment::from_bytes(1).unwrap().pow(), 0);
        assert_eq!(AllocAlignment::from_bytes(64).unwrap().pow(), 6);
        assert_eq!(
            AllocAlignment::from_bytes(0),
            Err(LayoutError::IncorrectLayoutArgs)
        );
        assert_eq!(
            AllocAlignment::from_bytes(24),
            Err(LayoutError::IncorrectLayoutArgs)
        );
    }

    #[test]
    fn test_alignment_pow_limit() {
        assert!(AllocAlignment::new(AllocAlignment::MAX_POW).is_ok());
        assert!(AllocAlignment::new(AllocAlignment::MAX_POW + 1).is_err());
    }

    #[test]
    fn test_align_size() {
        let a = AllocAlignment::from_bytes(8).unwrap();
        let size = |n| NonZeroUsize::new(n).unwrap();
        assert_eq!(a.align_size(size(1)), Some(size(8)));
        assert_eq!(a.align_size(size(8)), Some(size(8)));
        assert_eq!(a.align_size(size(9)), Some(size(16)));
        assert_eq!(a.align_size(size(usize::MAX)), None);
    }

    #[test]
    fn test_layout_validation() {
        assert_eq!(
            MemoryLayout::from_raw(0, 8),
            Err(LayoutError::IncorrectLayoutArgs)
        );
        assert_eq!(
            MemoryLayout::from_raw(16, 3),
            Err(LayoutError::IncorrectLayoutArgs)
        );
        assert_eq!(
            MemoryLayout::from_raw(usize::MAX, 4096),
            Err(LayoutError::IncorrectLayoutArgs)
        );
        let layout = MemoryLayout::from_raw(100, 4).unwrap();
        assert_eq!(layout.size().get(), 100);
        assert_eq!(layout.alignment().bytes(), 4);
    }
}
