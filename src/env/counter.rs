use std::{
    cell::Cell,
    sync::atomic::{
        fence, AtomicU32, AtomicUsize,
        Ordering::{Acquire, Relaxed, Release},
    },
};

/// The reference counter policy.
///
/// `increment` only needs to be atomic, nothing is published by it => Relaxed.
/// `decrement_and_test` must make every other release happen-before the finalizer of the last one =>
/// Release on the decrement and an Acquire fence on the zero path, same as the Arc drop.
pub trait AtomicCounter {
    fn new(value: usize) -> Self;

    fn set(&self, value: usize);

    /// Returns the value after the increment
    fn increment(&self) -> usize;

    /// `true` if the decrement brought the counter to exactly zero
    fn decrement_and_test(&self) -> bool;

    fn get(&self) -> usize;
}

impl AtomicCounter for AtomicUsize {
    fn new(value: usize) -> Self {
        AtomicUsize::new(value)
    }

    fn set(&self, value: usize) {
        self.store(value, Release);
    }

    fn increment(&self) -> usize {
        let previous = self.fetch_add(1, Relaxed);
        // a reasonable limit, leave some room above it for the threads racing to the abort
        if previous > usize::MAX / 2 {
            std::process::abort();
        }
        previous + 1
    }

    fn decrement_and_test(&self) -> bool {
        if self.fetch_sub(1, Release) == 1 {
            fence(Acquire);
            true
        } else {
            false
        }
    }

    fn get(&self) -> usize {
        self.load(Relaxed)
    }
}

// a count that doesn't fit is as broken as an overflowing increment
fn narrow(value: usize) -> u32 {
    u32::try_from(value).unwrap_or_else(|_| std::process::abort())
}

/// Same as the usize one, fits the futex word size
impl AtomicCounter for AtomicU32 {
    fn new(value: usize) -> Self {
        AtomicU32::new(narrow(value))
    }

    fn set(&self, value: usize) {
        self.store(narrow(value), Release);
    }

    fn increment(&self) -> usize {
        let previous = self.fetch_add(1, Relaxed);
        if previous > u32::MAX / 2 {
            std::process::abort();
        }
        previous as usize + 1
    }

    fn decrement_and_test(&self) -> bool {
        if self.fetch_sub(1, Release) == 1 {
            fence(Acquire);
            true
        } else {
            false
        }
    }

    fn get(&self) -> usize {
        self.load(Relaxed) as usize
    }
}

/// Plain `++` / `--`. [Cell] is !Sync, so whatever embeds it stays on one thread.
impl AtomicCounter for Cell<usize> {
    fn new(value: usize) -> Self {
        Cell::new(value)
    }

    fn set(&self, value: usize) {
        Cell::set(self, value);
    }

    fn increment(&self) -> usize {
        let value = Cell::get(self) + 1;
        Cell::set(self, value);
        value
    }

    fn decrement_and_test(&self) -> bool {
        let value = Cell::get(self) - 1;
        Cell::set(self, value);
        value == 0
    }

    fn get(&self) -> usize {
        Cell::get(self)
    }
}
