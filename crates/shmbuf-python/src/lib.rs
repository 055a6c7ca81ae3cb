//! Python bindings for shmbuf

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyBytes;
use shmbuf_core::{
    global, ChunkDescriptor, PosixShmConfig, PosixShmProviderBackend, ShmBuf as CoreShmBuf,
    ShmMut as CoreShmMut, ShmProvider, ShmProviderBuilder, POSIX_PROTOCOL_ID,
};
use std::num::NonZeroUsize;

/// Convert a shmbuf error to a Python exception
fn to_py_err(e: impl std::fmt::Display) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

fn consumed() -> PyErr {
    PyRuntimeError::new_err("buffer was consumed")
}

fn descriptor_tuple(d: ChunkDescriptor) -> (u32, u32, usize) {
    (d.segment, d.chunk, d.len.get())
}

/// Python wrapper for a POSIX shared memory provider
#[pyclass]
struct PosixShmProvider {
    inner: ShmProvider<PosixShmProviderBackend>,
}

#[pymethods]
impl PosixShmProvider {
    /// Create a provider, optionally configured from JSON
    #[new]
    #[pyo3(signature = (config_json = None))]
    fn new(config_json: Option<&str>) -> PyResult<Self> {
        let config = match config_json {
            Some(json) => PosixShmConfig::from_json(json).map_err(to_py_err)?,
            None => PosixShmConfig::default(),
        };
        let backend = PosixShmProviderBackend::new(&config).map_err(to_py_err)?;
        Ok(Self {
            inner: ShmProviderBuilder::backend(backend).build(),
        })
    }

    #[pyo3(signature = (size, align = 1))]
    fn alloc(&self, size: usize, align: usize) -> PyResult<ShmMut> {
        let buf = self.inner.alloc(size, align).map_err(to_py_err)?;
        Ok(ShmMut { inner: Some(buf) })
    }

    fn available(&self) -> usize {
        self.inner.available()
    }

    fn defragment(&self) -> usize {
        self.inner.defragment()
    }

    #[getter]
    fn segment(&self) -> u32 {
        self.inner.backend().segment().id()
    }
}

/// Python wrapper for an exclusive, writable buffer
#[pyclass]
struct ShmMut {
    inner: Option<CoreShmMut>,
}

#[pymethods]
impl ShmMut {
    fn __len__(&self) -> PyResult<usize> {
        Ok(self.inner.as_ref().ok_or_else(consumed)?.len())
    }

    /// Copy `data` into the buffer at `offset`
    #[pyo3(signature = (data, offset = 0))]
    fn write(&mut self, data: &[u8], offset: usize) -> PyResult<()> {
        let buf = self.inner.as_mut().ok_or_else(consumed)?;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| {
                PyValueError::new_err(format!(
                    "write of {} bytes at {} exceeds buffer of {}",
                    data.len(),
                    offset,
                    buf.len()
                ))
            })?;
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read<'py>(&self, py: Python<'py>) -> PyResult<&'py PyBytes> {
        let buf = self.inner.as_ref().ok_or_else(consumed)?;
        Ok(PyBytes::new(py, buf))
    }

    /// (segment, chunk, len)
    fn descriptor(&self) -> PyResult<(u32, u32, usize)> {
        Ok(descriptor_tuple(
            self.inner.as_ref().ok_or_else(consumed)?.descriptor(),
        ))
    }

    /// Make the buffer shareable; this object becomes unusable
    fn freeze(&mut self) -> PyResult<ShmBuf> {
        let buf = self.inner.take().ok_or_else(consumed)?;
        Ok(ShmBuf {
            inner: Some(buf.freeze()),
        })
    }
}

/// Python wrapper for a shared, read-only buffer
#[pyclass]
struct ShmBuf {
    inner: Option<CoreShmBuf>,
}

#[pymethods]
impl ShmBuf {
    fn __len__(&self) -> PyResult<usize> {
        Ok(self.inner.as_ref().ok_or_else(consumed)?.len())
    }

    fn read<'py>(&self, py: Python<'py>) -> PyResult<&'py PyBytes> {
        let buf = self.inner.as_ref().ok_or_else(consumed)?;
        Ok(PyBytes::new(py, buf))
    }

    fn descriptor(&self) -> PyResult<(u32, u32, usize)> {
        Ok(descriptor_tuple(
            self.inner.as_ref().ok_or_else(consumed)?.descriptor(),
        ))
    }

    fn clone(&self) -> PyResult<ShmBuf> {
        Ok(ShmBuf {
            inner: Some(self.inner.as_ref().ok_or_else(consumed)?.clone()),
        })
    }

    fn ref_count(&self) -> PyResult<usize> {
        Ok(self.inner.as_ref().ok_or_else(consumed)?.ref_count())
    }

    /// Regain exclusive access; fails while other references exist
    fn try_downgrade(&mut self) -> PyResult<ShmMut> {
        let buf = self.inner.take().ok_or_else(consumed)?;
        match buf.try_downgrade() {
            Ok(buf) => Ok(ShmMut { inner: Some(buf) }),
            Err(e) => {
                let msg = e.to_string();
                self.inner = Some(e.into_inner());
                Err(PyRuntimeError::new_err(msg))
            }
        }
    }

    /// Drop this reference now instead of at garbage collection
    fn release(&mut self) {
        self.inner = None;
    }
}

/// Map a chunk allocated by another process
#[pyfunction]
fn attach(segment: u32, chunk: u32, len: usize) -> PyResult<ShmBuf> {
    let len = NonZeroUsize::new(len).ok_or_else(|| PyValueError::new_err("len must be > 0"))?;
    let buf = global::client_storage()
        .attach_chunk(POSIX_PROTOCOL_ID, ChunkDescriptor::new(segment, chunk, len))
        .map_err(to_py_err)?;
    Ok(ShmBuf { inner: Some(buf) })
}

#[pymodule]
fn shmbuf(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PosixShmProvider>()?;
    m.add_class::<ShmMut>()?;
    m.add_class::<ShmBuf>()?;
    m.add_function(wrap_pyfunction!(attach, m)?)?;
    Ok(())
}
