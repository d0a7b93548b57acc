//! # Environment primitives
//!
//! Every other module is generic over two tiny policies:
//! - [AtomicCounter] - `set`, `increment`, `decrement_and_test` on an integer, used by [crate::refs]
//! - [RawMutex] - `new` (init), `lock`, `unlock` with no data attached, used by [crate::shareable] and [crate::synchronize]
//!
//! Both come with defaults ([std::sync::atomic::AtomicUsize] and [FutexMutex]), so most users never name them.
//! Swapping them is how a different threading library (or a mocked one in tests) is plugged in.
//!
//! ## Why a raw mutex
//! [std::sync::Mutex] owns its data and hands out a guard. Here the data lives elsewhere
//! (a [crate::shareable::Shareable] payload, or nothing at all for a synchronized section),
//! so the lock is just a lock. The guard is built on top, see [RawGuard].

use std::marker::PhantomData;

mod counter;
mod futex;
mod probe;
#[cfg(unix)]
mod pthread;
mod spin;

pub use counter::AtomicCounter;
pub use futex::FutexMutex;
pub use probe::Instrumented;
#[cfg(unix)]
pub use pthread::PthreadMutex;
pub use spin::SpinMutex;

/// A lock without data.
///
/// # Safety
/// Implementors must provide mutual exclusion: between a `lock` returning and the matching `unlock`,
/// no other `lock` on the same instance may return.
pub unsafe trait RawMutex {
    /// A fresh, unlocked mutex
    fn new() -> Self;

    /// Blocks until the mutex is acquired by the current thread
    fn lock(&self);

    /// # Safety
    /// The mutex must be locked, and every reference derived from that locking must be gone.
    unsafe fn unlock(&self);
}

/// Unlocks the raw mutex on drop, i.e. on every exit path of the scope that holds it.
///
/// The unlock has to happen on the locking thread (pthread mutexes require it), so the guard can't be sent:
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<cmx::env::RawGuard<'static, cmx::env::FutexMutex>>();
/// ```
pub struct RawGuard<'a, M: RawMutex> {
    mutex: &'a M,
    // !Send
    _not_send: PhantomData<*const ()>,
}

// a shared guard gives nothing but the knowledge that the mutex is held
unsafe impl<M: RawMutex + Sync> Sync for RawGuard<'_, M> {}

impl<'a, M: RawMutex> RawGuard<'a, M> {
    pub fn lock(mutex: &'a M) -> Self {
        mutex.lock();
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }
}

impl<M: RawMutex> Drop for RawGuard<'_, M> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only after a successful lock
        unsafe { self.mutex.unlock() }
    }
}
