//! The default [RawMutex]: a futex-backed lock.
//!
//! `wait` and `wake` take no part in correctness, they just spare the processor cycles.
//! The state has 3 values so the unlock can skip the wake syscall when nobody sleeps:
//! - 0 - unlocked
//! - 1 - locked, no other threads
//! - 2 - locked, other threads are (possibly) waiting
//!
//! Uncontended lock and unlock make no syscalls at all.

use std::sync::atomic::{
    AtomicU32,
    Ordering::{Acquire, Relaxed, Release},
};

use atomic_wait::{wait, wake_one};

use super::RawMutex;

pub struct FutexMutex {
    state: AtomicU32,
}

impl FutexMutex {
    /// const so it can back a `static`, see [crate::synchronized]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// spin briefly first, critical sections are usually short; then sleep on the state
    #[cold]
    fn lock_contended(&self) {
        let mut spin_count = 0;

        // load, not compare_exchange, to keep the cache line shared while spinning
        // only check for 1, 2 means another thread already gave up spinning
        while self.state.load(Relaxed) == 1 && spin_count < 100 {
            spin_count += 1;
            std::hint::spin_loop();
        }

        if self.state.compare_exchange(0, 1, Acquire, Relaxed).is_ok() {
            return;
        }

        // leave 2 behind so the unlock knows to wake somebody
        while self.state.swap(2, Acquire) != 0 {
            wait(&self.state, 2);
        }
    }
}

impl Default for FutexMutex {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for FutexMutex {
    fn new() -> Self {
        FutexMutex::new()
    }

    fn lock(&self) {
        if self.state.compare_exchange(0, 1, Acquire, Relaxed).is_err() {
            self.lock_contended();
        }
    }

    unsafe fn unlock(&self) {
        if self.state.swap(0, Release) == 2 {
            wake_one(&self.state);
        }
    }
}
