//! Fixed-size opaque records
//!
//! Foreign callers hold buffer handles as plain byte blobs of a fixed size.
//! An [`OpaqueRecord<T, N>`] is exactly `N` bytes, 8-byte aligned, and stores
//! an `Option<T>` inside; the layout follows from `T`, a build fails if `T`
//! stops fitting. Only the methods below may look inside a record.

use crate::buffer::{ShmBuf, ShmMut};
use crate::provider::BufAllocResult;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr;

/// `N` opaque bytes holding an optional `T`
#[repr(C, align(8))]
pub struct OpaqueRecord<T, const N: usize> {
    bytes: [MaybeUninit<u8>; N],
    _marker: PhantomData<T>,
}

/// Owned mutable buffer record
pub type OwnedShmMut = OpaqueRecord<ShmMut, 80>;

/// Owned allocation result record
pub type OwnedBufAllocResult = OpaqueRecord<BufAllocResult, 48>;

/// Owned shared buffer record
pub type OwnedShmBuf = OpaqueRecord<ShmBuf, 16>;

impl<T, const N: usize> OpaqueRecord<T, N> {
    const FITS: () = assert!(
        mem::size_of::<Option<T>>() <= N && mem::align_of::<Option<T>>() <= 8,
        "type does not fit its opaque record"
    );

    pub fn new(value: T) -> Self {
        Self::from_option(Some(value))
    }

    /// Record holding nothing
    pub fn null() -> Self {
        Self::from_option(None)
    }

    fn from_option(value: Option<T>) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::FITS;

        let mut record = Self {
            bytes: [MaybeUninit::uninit(); N],
            _marker: PhantomData,
        };
        // Safety: FITS guarantees size and alignment of the slot
        unsafe { record.slot_ptr().write(value) };
        record
    }

    fn slot_ptr(&mut self) -> *mut Option<T> {
        self.bytes.as_mut_ptr().cast()
    }

    fn slot(&self) -> &Option<T> {
        // Safety: initialized in from_option and kept initialized
        unsafe { &*self.bytes.as_ptr().cast::<Option<T>>() }
    }

    fn slot_mut(&mut self) -> &mut Option<T> {
        unsafe { &mut *self.slot_ptr() }
    }

    pub fn is_null(&self) -> bool {
        self.slot().is_none()
    }

    pub fn get(&self) -> Option<&T> {
        self.slot().as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.slot_mut().as_mut()
    }

    /// Move the value out, leaving the record null
    pub fn take(&mut self) -> Option<T> {
        self.slot_mut().take()
    }

    /// Drop the value in place, leaving the record null
    pub fn clear(&mut self) {
        *self.slot_mut() = None;
    }

    pub fn into_inner(mut self) -> Option<T> {
        self.take()
    }
}

impl<T, const N: usize> Drop for OpaqueRecord<T, N> {
    fn drop(&mut self) {
        unsafe { ptr::drop_in_place(self.slot_ptr()) }
    }
}

impl<T, const N: usize> Default for OpaqueRecord<T, N> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T, const N: usize> From<T> for OpaqueRecord<T, N> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: fmt::Debug, const N: usize> fmt::Debug for OpaqueRecord<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OpaqueRecord").field(self.slot()).finish()
    }
}
