//! Offset allocator over a contiguous region

use crate::error::AllocError;
use std::collections::{BTreeMap, HashMap};

/// First-fit free list with deferred coalescing
///
/// Freed blocks stay separate until [`defragment`](Self::defragment). An
/// allocation that fails while enough bytes are free in unmerged blocks
/// reports [`AllocError::NeedDefragment`].
#[derive(Debug)]
pub struct FreeList {
    capacity: usize,
    /// offset -> len
    free: BTreeMap<usize, usize>,
    /// offset -> len
    used: HashMap<usize, usize>,
    free_bytes: usize,
    /// Blocks were freed since the last defragmentation
    dirty: bool,
}

impl FreeList {
    pub fn new(capacity: usize) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            free,
            used: HashMap::new(),
            free_bytes: capacity,
            dirty: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total free bytes, fragmented or not
    pub fn available(&self) -> usize {
        self.free_bytes
    }

    pub fn largest_free(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Number of outstanding blocks
    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    /// Reserve `size` bytes at an offset that is a multiple of `align`
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<usize, AllocError> {
        debug_assert!(align.is_power_of_two());
        let found = self.free.iter().find_map(|(&offset, &len)| {
            let start = align_up(offset, align)?;
            let needed = (start - offset).checked_add(size)?;
            (len >= needed).then_some((offset, len, start))
        });

        let Some((offset, len, start)) = found else {
            return Err(if self.dirty && self.free_bytes >= size {
                AllocError::NeedDefragment
            } else {
                AllocError::OutOfMemory
            });
        };

        self.free.remove(&offset);
        if start > offset {
            self.free.insert(offset, start - offset);
        }
        let end = start + size;
        let block_end = offset + len;
        if block_end > end {
            self.free.insert(end, block_end - end);
        }
        self.used.insert(start, size);
        self.free_bytes -= size;
        Ok(start)
    }

    /// Release the block at `offset`, returning its length
    ///
    /// `None` means no block starts there: a double free or a foreign offset.
    pub fn free(&mut self, offset: usize) -> Option<usize> {
        let len = self.used.remove(&offset)?;
        self.free.insert(offset, len);
        self.free_bytes += len;
        self.dirty = true;
        Some(len)
    }

    /// Merge adjacent free blocks, returns the bytes that ended up in merged blocks
    pub fn defragment(&mut self) -> usize {
        let mut merged = BTreeMap::new();
        let mut reclaimed = 0;
        // (start, len, absorbed a neighbour)
        let mut run: Option<(usize, usize, bool)> = None;

        for (&offset, &len) in &self.free {
            run = match run {
                Some((start, run_len, _)) if start + run_len == offset => {
                    Some((start, run_len + len, true))
                }
                Some((start, run_len, grew)) => {
                    if grew {
                        reclaimed += run_len;
                    }
                    merged.insert(start, run_len);
                    Some((offset, len, false))
                }
                None => Some((offset, len, false)),
            };
        }
        if let Some((start, run_len, grew)) = run {
            if grew {
                reclaimed += run_len;
            }
            merged.insert(start, run_len);
        }

        self.free = merged;
        self.dirty = false;
        reclaimed
    }
}

fn align_up(offset: usize, align: usize) -> Option<usize> {
    Some(offset.checked_add(align - 1)? & !(align - 1))
}
