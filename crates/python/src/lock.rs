//! Scoped access to the interpreter lock
//!
//! Every touch of an embedded object goes through [`with_lock`]. The closure
//! receives the `Python<'py>` token; all marshaling functions take that token
//! (directly or through a `Bound<'py, _>`), so embedded objects cannot be
//! reached without holding the lock. The lock is released on every exit path
//! of the closure, including unwinding.
//!
//! Acquisition is not re-entrant: a thread already inside `with_lock` must not
//! call it again. Nested acquisition is reported and trips a debug assertion.
//! Work that needs the lock but is discovered while it is already held (a
//! stage dropped inside `with_lock`) is queued with [`defer`] and runs when
//! the outermost `with_lock` scope finishes.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use pyo3::prelude::*;

type Deferred = Box<dyn for<'py> FnOnce(Python<'py>) + Send>;

static DEFERRED: Mutex<Vec<Deferred>> = parking_lot::const_mutex(Vec::new());
static DEFERRED_COUNT: AtomicU64 = AtomicU64::new(0);

static ACQUISITIONS: AtomicU64 = AtomicU64::new(0);
static HOLDERS: AtomicUsize = AtomicUsize::new(0);
static MAX_HOLDERS: AtomicUsize = AtomicUsize::new(0);
static NESTED: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Counters describing lock usage since start or the last [`reset_stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    pub acquisitions: u64,
    /// Largest number of threads observed inside `with_lock` at once
    pub max_concurrent_holders: usize,
    pub nested_acquisitions: u64,
    /// Jobs queued with [`defer`]
    pub deferred: u64,
}

pub fn stats() -> LockStats {
    LockStats {
        acquisitions: ACQUISITIONS.load(Ordering::SeqCst),
        max_concurrent_holders: MAX_HOLDERS.load(Ordering::SeqCst),
        nested_acquisitions: NESTED.load(Ordering::SeqCst),
        deferred: DEFERRED_COUNT.load(Ordering::SeqCst),
    }
}

pub fn reset_stats() {
    ACQUISITIONS.store(0, Ordering::SeqCst);
    MAX_HOLDERS.store(HOLDERS.load(Ordering::SeqCst), Ordering::SeqCst);
    NESTED.store(0, Ordering::SeqCst);
    DEFERRED_COUNT.store(0, Ordering::SeqCst);
}

/// Queue `f` to run under the lock once the outermost [`with_lock`] scope
/// on any thread finishes
pub fn defer<F>(f: F)
where
    F: for<'py> FnOnce(Python<'py>) + Send + 'static,
{
    DEFERRED_COUNT.fetch_add(1, Ordering::SeqCst);
    DEFERRED.lock().push(Box::new(f));
}

fn run_deferred(py: Python<'_>) {
    loop {
        let batch = std::mem::take(&mut *DEFERRED.lock());
        if batch.is_empty() {
            return;
        }
        for job in batch {
            job(py);
        }
    }
}

/// Whether the calling thread is inside [`with_lock`]
pub fn is_held() -> bool {
    DEPTH.with(|d| d.get() > 0)
}

struct Held;

impl Held {
    fn enter() -> Self {
        DEPTH.with(|d| d.set(d.get() + 1));
        ACQUISITIONS.fetch_add(1, Ordering::SeqCst);
        let holders = HOLDERS.fetch_add(1, Ordering::SeqCst) + 1;
        MAX_HOLDERS.fetch_max(holders, Ordering::SeqCst);
        Held
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        HOLDERS.fetch_sub(1, Ordering::SeqCst);
        DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Run `f` holding the interpreter lock
pub fn with_lock<F, R>(f: F) -> R
where
    F: for<'py> FnOnce(Python<'py>) -> R,
{
    if is_held() {
        NESTED.fetch_add(1, Ordering::SeqCst);
        tracing::error!("interpreter lock acquired re-entrantly on the same thread");
        debug_assert!(false, "interpreter lock acquired re-entrantly");
    }
    Python::attach(|py| {
        let _held = Held::enter();
        let result = f(py);
        if DEPTH.with(|d| d.get()) == 1 {
            run_deferred(py);
        }
        result
    })
}

/// Run host-only work with the lock temporarily released
pub fn without_lock<F, R>(py: Python<'_>, f: F) -> R
where
    F: Send + FnOnce() -> R,
    R: Send,
{
    let depth = DEPTH.with(|d| d.replace(0));
    HOLDERS.fetch_sub(1, Ordering::SeqCst);
    let result = py.detach(f);
    HOLDERS.fetch_add(1, Ordering::SeqCst);
    DEPTH.with(|d| d.set(depth));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_tracks_scope() {
        assert!(!is_held());
        let inside = with_lock(|_py| is_held());
        assert!(inside);
        assert!(!is_held());
    }

    #[test]
    fn test_released_after_panic() {
        let result = std::panic::catch_unwind(|| {
            with_lock(|_py| panic!("boom"));
        });
        assert!(result.is_err());
        assert!(!is_held());
    }

    #[test]
    fn test_deferred_work_runs_when_outermost_scope_ends() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let ran = Arc::new(AtomicBool::new(false));
        let before = stats().deferred;
        with_lock(|_py| {
            let flag = Arc::clone(&ran);
            defer(move |_py| flag.store(true, Ordering::SeqCst));
            assert!(!ran.load(Ordering::SeqCst));
        });
        assert!(ran.load(Ordering::SeqCst));
        assert!(stats().deferred > before);
    }

    #[test]
    fn test_without_lock_restores_depth() {
        with_lock(|py| {
            let inner = without_lock(py, is_held);
            assert!(!inner);
            assert!(is_held());
        });
    }
}
