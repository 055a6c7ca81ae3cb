//! Generic binary payload
//!
//! Messaging code carries a [`Payload`] and reads it as bytes; whether the
//! bytes live on the heap or in shared memory only matters to code that asks.

use crate::buffer::{ShmBuf, ShmMut};
use bytes::Bytes;
use std::ops::Deref;

#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Bytes),
    Shm(ShmBuf),
}

impl Payload {
    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_ref().is_empty()
    }

    pub fn is_shm(&self) -> bool {
        matches!(self, Payload::Shm(_))
    }

    /// The shared memory buffer, if this payload is one
    pub fn as_shm(&self) -> Option<&ShmBuf> {
        match self {
            Payload::Shm(buf) => Some(buf),
            Payload::Bytes(_) => None,
        }
    }

    /// Unwrap the shared memory buffer, or give the payload back
    pub fn into_shm(self) -> Result<ShmBuf, Payload> {
        match self {
            Payload::Shm(buf) => Ok(buf),
            other => Err(other),
        }
    }

    /// Copy the contents into heap bytes
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::Shm(buf) => Bytes::copy_from_slice(buf),
        }
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Shm(buf) => buf,
        }
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl From<ShmBuf> for Payload {
    fn from(buf: ShmBuf) -> Self {
        Payload::Shm(buf)
    }
}

impl From<ShmMut> for Payload {
    fn from(buf: ShmMut) -> Self {
        Payload::Shm(buf.freeze())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes.into())
    }
}
