//! POSIX provider configuration
//!
//! The configuration can be built in code with the `with_*` methods or
//! parsed from JSON, e.g. `{"size": 1048576, "alignment_pow": 6}`.
//! Missing fields take their defaults.

use crate::types::AllocAlignment;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default segment size (16 MiB)
pub const DEFAULT_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Default allocation granularity exponent (8 bytes)
pub const DEFAULT_ALIGNMENT_POW: u8 = 3;

/// Largest supported alignment exponent: segments are page aligned
pub const MAX_ALIGNMENT_POW: u8 = 12;

/// Default OS name prefix for segments
pub const DEFAULT_SEGMENT_PREFIX: &str = "shmbuf";

/// Configuration of a POSIX shared memory backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PosixShmConfig {
    /// Usable bytes in the segment
    pub size: usize,
    /// Every chunk is aligned to and rounded up to 2^alignment_pow bytes
    pub alignment_pow: u8,
    /// Prefix of the OS object name, shared with the clients that map it
    pub segment_prefix: String,
}

impl Default for PosixShmConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_SEGMENT_SIZE,
            alignment_pow: DEFAULT_ALIGNMENT_POW,
            segment_prefix: DEFAULT_SEGMENT_PREFIX.to_string(),
        }
    }
}

impl PosixShmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_alignment(mut self, alignment: AllocAlignment) -> Self {
        self.alignment_pow = alignment.pow();
        self
    }

    pub fn with_segment_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.segment_prefix = prefix.into();
        self
    }

    /// Allocation granularity
    pub fn alignment(&self) -> Result<AllocAlignment> {
        if self.alignment_pow > MAX_ALIGNMENT_POW {
            return Err(Error::InvalidConfig(format!(
                "alignment_pow must be at most {}, got {}",
                MAX_ALIGNMENT_POW, self.alignment_pow
            )));
        }
        Ok(AllocAlignment::new(self.alignment_pow)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::InvalidConfig("size must be greater than 0".to_string()));
        }
        // Chunk ids are offsets into the segment
        if u32::try_from(self.size).is_err() {
            return Err(Error::InvalidConfig(format!(
                "size must fit in 32 bits, got {}",
                self.size
            )));
        }

        let alignment = self.alignment()?;
        if !alignment.is_aligned(self.size) {
            return Err(Error::InvalidConfig(format!(
                "size {} is not a multiple of the alignment {}",
                self.size, alignment
            )));
        }

        if self.segment_prefix.is_empty()
            || !self
                .segment_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::InvalidConfig(format!(
                "segment_prefix must be non-empty and [A-Za-z0-9_-], got {:?}",
                self.segment_prefix
            )));
        }

        Ok(())
    }
}
