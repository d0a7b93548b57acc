/*
 * A spinning RawMutex.
 * Not practical for long critical sections, but fine when the lock is held for brief moments
 * and there's no OS to sleep on.
 */

use std::sync::atomic::{
    AtomicBool,
    Ordering::{Acquire, Release},
};

use super::RawMutex;

pub struct SpinMutex {
    locked: AtomicBool,
}

impl SpinMutex {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

impl Default for SpinMutex {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for SpinMutex {
    fn new() -> Self {
        SpinMutex::new()
    }

    fn lock(&self) {
        // Acquire makes sure the previous owner has happens-before with the current one
        while self.locked.swap(true, Acquire) {
            std::hint::spin_loop();
        }
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Release);
    }
}
