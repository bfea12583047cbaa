//! Zero-copy blob views and shared blob owners
//!
//! A [`ScopedBufferView`] exposes host blob memory to embedded code as a
//! read-only `memoryview` without copying. Views live in the [`CallScope`]
//! of one invocation and are released before the scope ends, so the host
//! record can be dropped afterwards. A view whose buffer is still exported
//! (for example through `numpy.frombuffer`) cannot be released; its memory
//! is then pinned for the rest of the process instead of being freed under
//! embedded code.
//!
//! [`shared_blob`] goes the other way: it wraps an embedded `bytes` object in
//! a [`Bytes`] that keeps one reference to it, so a map stage can hand its
//! output to several consumers without copying.

use std::os::raw::{c_char, c_int};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::types::PyBytes;

use super::CallScope;

/// `PyBUF_READ`
const READ_ONLY: c_int = 0x100;

static CREATED: AtomicU64 = AtomicU64::new(0);
static RELEASED: AtomicU64 = AtomicU64::new(0);
static PINNED: AtomicU64 = AtomicU64::new(0);
static PINNED_BYTES: AtomicU64 = AtomicU64::new(0);

/// Process-wide view counters.
///
/// A pinned view's host memory stays allocated until the process exits.
/// Exporters such as `numpy.frombuffer` hold a raw pointer into that
/// memory, so it cannot be swapped for a copy once the call returns.
/// `pinned_bytes` therefore only grows; a stage that keeps views alive on
/// every record leaks that much per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewStats {
    pub created: u64,
    pub released: u64,
    /// Views that could not be released and whose memory was leaked
    pub pinned: u64,
    /// Total size of the pinned memory
    pub pinned_bytes: u64,
}

impl ViewStats {
    /// Views created but neither released nor pinned yet
    pub fn outstanding(&self) -> u64 {
        self.created - self.released - self.pinned
    }
}

pub fn view_stats() -> ViewStats {
    ViewStats {
        created: CREATED.load(Ordering::SeqCst),
        released: RELEASED.load(Ordering::SeqCst),
        pinned: PINNED.load(Ordering::SeqCst),
        pinned_bytes: PINNED_BYTES.load(Ordering::SeqCst),
    }
}

/// A `memoryview` over host memory, valid until its scope ends
pub struct ScopedBufferView {
    view: Py<PyAny>,
    owner: Bytes,
}

impl ScopedBufferView {
    /// Create a view over `data` and register it with `scope`
    pub fn create<'py>(scope: &CallScope<'py>, data: &Bytes) -> PyResult<Bound<'py, PyAny>> {
        let py = scope.py();
        let owner = data.clone();
        // SAFETY: `owner` keeps the memory alive until the view is released,
        // and the view is read-only
        let view = unsafe {
            let ptr = ffi::PyMemoryView_FromMemory(
                owner.as_ptr() as *mut c_char,
                owner.len() as ffi::Py_ssize_t,
                READ_ONLY,
            );
            Bound::from_owned_ptr_or_err(py, ptr)?
        };
        CREATED.fetch_add(1, Ordering::SeqCst);
        scope.register_view(ScopedBufferView {
            view: view.clone().unbind(),
            owner,
        });
        Ok(view)
    }

    /// Release the view; on failure the memory is pinned
    pub(crate) fn release(self, py: Python<'_>) {
        match self.view.call_method0(py, "release") {
            Ok(_) => {
                RELEASED.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                tracing::warn!(
                    len = self.owner.len(),
                    error = %err.value(py),
                    "Blob view still exported after call; pinning its memory"
                );
                PINNED.fetch_add(1, Ordering::SeqCst);
                PINNED_BYTES.fetch_add(self.owner.len() as u64, Ordering::SeqCst);
                // the exporter may read through its pointer at any time
                std::mem::forget(self.owner);
            }
        }
    }
}

/// Owner of one reference to an embedded `bytes` object
struct PyBytesOwner {
    _object: Py<PyBytes>,
    ptr: *const u8,
    len: usize,
}

// SAFETY: `bytes` objects are immutable and the reference held in `_object`
// keeps the buffer in place; `Py` drops are deferred until the lock is held.
unsafe impl Send for PyBytesOwner {}

impl AsRef<[u8]> for PyBytesOwner {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: see the Send impl
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// A host blob sharing the memory of an embedded `bytes` object
pub fn shared_blob(object: &Bound<'_, PyBytes>) -> Bytes {
    let data = object.as_bytes();
    Bytes::from_owner(PyBytesOwner {
        ptr: data.as_ptr(),
        len: data.len(),
        _object: object.clone().unbind(),
    })
}
