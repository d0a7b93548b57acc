//! POSIX threads mutex as a [RawMutex].
//!
//! C objects frequently rely on a constant memory address, but Rust moves values around.
//! [Box] keeps `pthread_mutex_t` in place while the wrapper moves.
//!
//! Downsides:
//! - extra heap allocation for each mutex
//! - `new` cannot be `const` => no `static` pthread mutex here, [super::FutexMutex] covers that
//! - default attributes => re-locking from the owning thread is a deadlock

use std::cell::UnsafeCell;

use super::RawMutex;

pub struct PthreadMutex {
    m: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

// the pthread mutex is made to be shared between threads
unsafe impl Send for PthreadMutex {}
unsafe impl Sync for PthreadMutex {}

unsafe impl RawMutex for PthreadMutex {
    fn new() -> Self {
        Self {
            m: Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER)),
        }
    }

    fn lock(&self) {
        // SAFETY: the mutex is initialized and pinned by the box
        let rc = unsafe { libc::pthread_mutex_lock(self.m.get()) };
        debug_assert_eq!(rc, 0);
    }

    unsafe fn unlock(&self) {
        let rc = libc::pthread_mutex_unlock(self.m.get());
        debug_assert_eq!(rc, 0);
    }
}

impl Drop for PthreadMutex {
    fn drop(&mut self) {
        // destroying a locked mutex is UB in pthread, but &mut self means no guard is alive.
        // a leaked guard still leaves it locked => try-lock first, and skip destroy if that fails
        unsafe {
            if libc::pthread_mutex_trylock(self.m.get()) == 0 {
                libc::pthread_mutex_unlock(self.m.get());
                libc::pthread_mutex_destroy(self.m.get());
            }
        }
    }
}
