/*
 * Reference counting with explicit acquire / release.
 *
 * Two levels:
 * - RefCount - a counter field to embed into your own struct; you decide what "destroy" means
 * - RefCounted<T> - the counter and the payload on the heap, like Arc but with hooks on both release outcomes
 *
 * The decrement and the zero test are a single atomic op => exactly one release sees the zero,
 * no matter how the threads race. Everything else is caller discipline for RefCount,
 * and ownership for RefCounted (release consumes the handle).
 */

mod handle;

use std::sync::atomic::AtomicUsize;

use log::debug;
use strum_macros::{Display, IntoStaticStr};

use crate::env::AtomicCounter;

pub use handle::RefCounted;

/// What a release did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Release {
    /// the count hit zero, the owner is to be finalized
    Destroy,
    /// other references remain
    Alive,
}

/// Embeddable counter. Starts at 1.
pub struct RefCount<C: AtomicCounter = AtomicUsize> {
    count: C,
}

impl<C: AtomicCounter> RefCount<C> {
    pub fn new() -> Self {
        Self { count: C::new(1) }
    }

    /// Re-arms the counter at 1, for storage that is reused without running `new`
    pub fn init(&self) {
        self.count.set(1);
    }

    pub fn acquire(&self) {
        self.count.increment();
    }

    pub fn release(&self) -> Release {
        if self.count.decrement_and_test() {
            Release::Destroy
        } else {
            Release::Alive
        }
    }

    pub fn get(&self) -> usize {
        self.count.get()
    }
}

impl<C: AtomicCounter> Default for RefCount<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// A struct carrying a [RefCount] field.
pub trait Counted {
    type Counter: AtomicCounter;

    fn ref_count(&self) -> &RefCount<Self::Counter>;
}

/// Bumps the count of `ptr` and hands the same reference back, so it chains: `let x = acquire(y)`.
/// `None` is a no-op.
pub fn acquire<'a, H: Counted + ?Sized>(ptr: Option<&'a H>) -> Option<&'a H> {
    acquire_with(ptr, |_| {})
}

/// [acquire] plus a side effect, run after the increment
pub fn acquire_with<'a, H: Counted + ?Sized>(
    ptr: Option<&'a H>,
    on_acquire: impl FnOnce(&H),
) -> Option<&'a H> {
    let ptr = ptr?;
    ptr.ref_count().acquire();
    on_acquire(ptr);
    Some(ptr)
}

/// Drops one reference of `ptr`.
/// Exactly one of the branches runs, and only for `Some`: `on_destroy` when the count hit zero, `on_alive` otherwise.
/// After `on_destroy` the pointee must not be used as a counted object anymore.
pub fn release<H: Counted + ?Sized, R>(
    ptr: Option<&H>,
    on_destroy: impl FnOnce(&H) -> R,
    on_alive: impl FnOnce(&H) -> R,
) -> Option<R> {
    let ptr = ptr?;
    Some(match ptr.ref_count().release() {
        Release::Destroy => on_destroy(ptr),
        Release::Alive => on_alive(ptr),
    })
}

pub fn run() {
    struct Document {
        refs: RefCount,
        title: &'static str,
    }

    impl Counted for Document {
        type Counter = AtomicUsize;
        fn ref_count(&self) -> &RefCount {
            &self.refs
        }
    }

    let doc = Document {
        refs: RefCount::new(),
        title: "notes",
    };
    let reader = acquire(Some(&doc));
    println!("{} has {} references", doc.title, doc.refs.get());
    for d in [reader, Some(&doc)] {
        let outcome = release(d, |_| Release::Destroy, |_| Release::Alive);
        debug!("release of {}: {:?}", doc.title, outcome);
    }

    let shared: RefCounted<Vec<i32>> = RefCounted::new(vec![1, 2, 3]);
    let threads: Vec<_> = (0..3)
        .map(|t| {
            let mine = RefCounted::acquire(&shared);
            std::thread::spawn(move || {
                println!("thread {t} sums {}", mine.iter().sum::<i32>());
                RefCounted::release_with(Some(mine), |v| println!("thread {t} finalized {v:?}"), || ());
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    RefCounted::release_with(Some(shared), |v| println!("main finalized {v:?}"), || ());
}
