use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

use super::RawMutex;

/// A [RawMutex] wrapper that counts the operations done on the inner mutex.
///
/// Handy for checking that a code path locks exactly as often as expected (or not at all).
/// The counters are Relaxed, read them after the threads involved are joined.
pub struct Instrumented<M> {
    inner: M,
    locks: AtomicUsize,
    unlocks: AtomicUsize,
}

impl<M: RawMutex> Instrumented<M> {
    pub fn locks(&self) -> usize {
        self.locks.load(Relaxed)
    }

    pub fn unlocks(&self) -> usize {
        self.unlocks.load(Relaxed)
    }

    /// `true` between a lock and its unlock
    pub fn is_held(&self) -> bool {
        self.locks() != self.unlocks()
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

unsafe impl<M: RawMutex> RawMutex for Instrumented<M> {
    fn new() -> Self {
        Self {
            inner: M::new(),
            locks: AtomicUsize::new(0),
            unlocks: AtomicUsize::new(0),
        }
    }

    fn lock(&self) {
        self.inner.lock();
        // counted after acquiring => nobody sees a lock that isn't held yet
        self.locks.fetch_add(1, Relaxed);
    }

    unsafe fn unlock(&self) {
        self.unlocks.fetch_add(1, Relaxed);
        self.inner.unlock();
    }
}
