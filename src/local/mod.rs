//! # Local values
//!
//! Temporarily overwrite a variable for the duration of a scope, and put the old value back on every exit:
//! falling off the end, `return`, `?`, `break`, or a panic unwinding through the scope.
//! The restore lives in a guard's [Drop], so there's no way to skip it short of leaking the guard
//! (or unwinding with a [RefCell] slot still borrowed, see its [Slot] impl).
//!
//! Two flavours:
//! - [LocalMut] for a `&mut T` - the borrow checker makes the value reachable only through the guard
//! - [Local] for a shared [Slot] (`Cell`, `Mutex`, atomics, ...) - anyone else holding the slot sees the temporary value,
//!   other threads included for the thread-safe slots. Nothing is isolated per-thread here.
//!
//! Nesting works as a stack: each guard restores what it saw on entry.

use std::{
    cell::{Cell, RefCell},
    mem,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering::SeqCst},
        Mutex,
    },
};

use log::{debug, warn};

/// A location that can be swapped through a shared reference.
pub trait Slot {
    type Value;

    /// Stores `value`, returns what was there before
    fn replace(&self, value: Self::Value) -> Self::Value;

    /// Puts the saved value back, called from the guard's [Drop]
    fn restore(&self, saved: Self::Value) {
        self.replace(saved);
    }
}

impl<T> Slot for Cell<T> {
    type Value = T;
    fn replace(&self, value: T) -> T {
        Cell::replace(self, value)
    }
}

/// # Panics
/// If the cell is borrowed at the moment of the swap, same as [RefCell::replace].
/// The restore is the exception while a panic unwinds: a second panic would abort,
/// so a cell still borrowed at that point keeps the temporary value.
impl<T> Slot for RefCell<T> {
    type Value = T;
    fn replace(&self, value: T) -> T {
        RefCell::replace(self, value)
    }

    fn restore(&self, saved: T) {
        match self.try_borrow_mut() {
            Ok(mut current) => *current = saved,
            Err(_) if std::thread::panicking() => warn!("cell still borrowed while unwinding, not restored"),
            Err(borrowed) => panic!("restoring a local value: {borrowed}"),
        }
    }
}

/// A poisoned mutex still gets its value swapped, the restore must not be skipped
impl<T> Slot for Mutex<T> {
    type Value = T;
    fn replace(&self, value: T) -> T {
        let mut guard = self.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        mem::replace(&mut *guard, value)
    }
}

// SeqCst: the temporary value is meant to be seen by everyone in the same order as the code sets it
macro_rules! atomic_slot {
    ($($atomic:ty => $value:ty),* $(,)?) => {
        $(
            impl Slot for $atomic {
                type Value = $value;
                fn replace(&self, value: $value) -> $value {
                    self.swap(value, SeqCst)
                }
            }
        )*
    };
}

atomic_slot!(
    AtomicBool => bool,
    AtomicI32 => i32,
    AtomicU32 => u32,
    AtomicUsize => usize,
);

/// Restores the slot on drop.
#[must_use = "the value is restored as soon as the guard is dropped"]
pub struct Local<'a, S: Slot> {
    slot: &'a S,
    // Option only to move the value out in Drop
    saved: Option<S::Value>,
}

impl<S: Slot> Drop for Local<'_, S> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.slot.restore(saved);
        }
    }
}

/// Puts `value` into the slot until the returned guard goes away
pub fn local<S: Slot>(slot: &S, value: S::Value) -> Local<'_, S> {
    let saved = slot.replace(value);
    Local {
        slot,
        saved: Some(saved),
    }
}

/// Runs `body` with `value` in the slot, then restores the previous value
pub fn with_local<S: Slot, R>(slot: &S, value: S::Value, body: impl FnOnce() -> R) -> R {
    let _local = local(slot, value);
    body()
}

/// Exclusive flavour: the guard is the only way to reach the location while it's alive.
#[must_use = "the value is restored as soon as the guard is dropped"]
pub struct LocalMut<'a, T> {
    location: &'a mut T,
    saved: Option<T>,
}

impl<T> Deref for LocalMut<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.location
    }
}

impl<T> DerefMut for LocalMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.location
    }
}

impl<T> Drop for LocalMut<'_, T> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            *self.location = saved;
        }
    }
}

pub fn local_mut<T>(location: &mut T, value: T) -> LocalMut<'_, T> {
    let saved = mem::replace(location, value);
    LocalMut {
        location,
        saved: Some(saved),
    }
}

/// Runs `body` on the overwritten location, then restores the previous value.
/// The body may nest further `with_local_mut` calls on the same reference.
pub fn with_local_mut<T, R>(location: &mut T, value: T, body: impl FnOnce(&mut T) -> R) -> R {
    let mut local = local_mut(location, value);
    body(&mut *local)
}

pub fn run() {
    // perl's `local $x`: nested levels see their own value, the outer one comes back
    let mut depth = 0;
    with_local_mut(&mut depth, 1, |depth| {
        debug!("level 1 sees {depth}");
        with_local_mut(depth, 2, |depth| debug!("level 2 sees {depth}"));
        assert_eq!(*depth, 1);
    });
    assert_eq!(depth, 0);
    println!("depth is back to {depth}");

    // shared slots are visible to other threads while the guard lives
    let verbose = AtomicBool::new(false);
    std::thread::scope(|s| {
        let _local = local(&verbose, true);
        s.spawn(|| println!("another thread sees verbose = {}", verbose.load(SeqCst)))
            .join()
            .unwrap();
    });
    println!("verbose is back to {}", verbose.load(SeqCst));
}
