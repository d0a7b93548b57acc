use std::{
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::Deref,
    ptr::NonNull,
    sync::atomic::AtomicUsize,
};

use log::trace;

use super::{RefCount, Release};
use crate::env::AtomicCounter;

// the heap part
struct RefData<T, C: AtomicCounter> {
    refs: RefCount<C>,
    payload: T,
}

/// A counted pointer to a heap allocated `T`.
///
/// Every handle owns one reference. [RefCounted::acquire] makes another one, [RefCounted::release] gives one back
/// and tells which way it went. A handle dropped without an explicit release is released with the default finalizer:
/// the payload is just dropped.
///
/// Releasing consumes the handle => there's no way to touch the payload after the zero.
pub struct RefCounted<T, C: AtomicCounter = AtomicUsize> {
    ptr: NonNull<RefData<T, C>>,
    // we own RefData's for the drop checker
    _owns: PhantomData<RefData<T, C>>,
}

/*
 * Sending a handle shares T with the other handles => T: Sync,
 * and the last release may drop T on any thread => T: Send.
 * The counter is touched from every thread holding a handle => C: Send + Sync,
 * which keeps the Cell<usize> counter single-threaded.
 */
unsafe impl<T: Send + Sync, C: AtomicCounter + Send + Sync> Send for RefCounted<T, C> {}
unsafe impl<T: Send + Sync, C: AtomicCounter + Send + Sync> Sync for RefCounted<T, C> {}

impl<T, C: AtomicCounter> RefCounted<T, C> {
    /// The count starts at 1, owned by the returned handle
    pub fn new(payload: T) -> Self {
        Self {
            ptr: NonNull::from(Box::leak(Box::new(RefData {
                refs: RefCount::new(),
                payload,
            }))),
            _owns: PhantomData,
        }
    }

    fn data(&self) -> &RefData<T, C> {
        // SAFETY: the allocation lives while any handle does, and `self` is one
        unsafe { self.ptr.as_ref() }
    }

    /// Another handle to the same payload
    pub fn acquire(this: &Self) -> Self {
        this.data().refs.acquire();
        Self {
            ptr: this.ptr,
            _owns: PhantomData,
        }
    }

    /// [RefCounted::acquire] for an optional handle, with a side effect run after the increment
    pub fn acquire_with(this: Option<&Self>, on_acquire: impl FnOnce(&T)) -> Option<Self> {
        let this = this?;
        let acquired = Self::acquire(this);
        on_acquire(&*acquired);
        Some(acquired)
    }

    /// Gives the reference back. The payload comes out when this was the last one.
    pub fn release(this: Self) -> Option<T> {
        let this = ManuallyDrop::new(this);
        match this.data().refs.release() {
            Release::Destroy => {
                trace!("last reference released, finalizing");
                // SAFETY: the count is 0 => no other handle exists, and ours is not dropped again
                let data = unsafe { Box::from_raw(this.ptr.as_ptr()) };
                Some(data.payload)
            }
            Release::Alive => None,
        }
    }

    /// Runs exactly one of the branches for `Some`, none for `None`.
    /// `on_destroy` is the finalizer and receives the payload.
    pub fn release_with<R>(
        this: Option<Self>,
        on_destroy: impl FnOnce(T) -> R,
        on_alive: impl FnOnce() -> R,
    ) -> Option<R> {
        Some(match Self::release(this?) {
            Some(payload) => on_destroy(payload),
            None => on_alive(),
        })
    }

    /// A snapshot, other threads may be changing it
    pub fn count(this: &Self) -> usize {
        this.data().refs.get()
    }

    /// `Some` only for the last handle, as the payload can't be seen by anyone else then
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        if Self::count(this) == 1 {
            // make sure the other handles' releases are finished
            std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
            // SAFETY: a single handle exists and we hold it exclusively
            unsafe { Some(&mut this.ptr.as_mut().payload) }
        } else {
            None
        }
    }
}

impl<T, C: AtomicCounter> Deref for RefCounted<T, C> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.data().payload
    }
}

impl<T, C: AtomicCounter> Clone for RefCounted<T, C> {
    fn clone(&self) -> Self {
        Self::acquire(self)
    }
}

impl<T, C: AtomicCounter> Drop for RefCounted<T, C> {
    fn drop(&mut self) {
        if self.data().refs.release() == Release::Destroy {
            trace!("last reference dropped, finalizing");
            // SAFETY: the count is 0 => no other handle exists
            drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
        }
    }
}

// the best way to run these is `cargo +nightly miri test'
#[cfg(test)]
mod test {
    use super::*;
    use std::{
        cell::Cell,
        sync::{
            atomic::{AtomicUsize, Ordering::Relaxed},
            Barrier,
        },
        thread::{scope, spawn},
    };

    // counts drops of whatever it's attached to; each test has its own counter
    struct DetectDrop<'a>(&'a AtomicUsize);
    impl Drop for DetectDrop<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn drop_finalizes_once() {
        static NUM_DROPS: AtomicUsize = AtomicUsize::new(0);

        let x: RefCounted<_> = RefCounted::new(("msg", DetectDrop(&NUM_DROPS)));
        let y = x.clone();

        let jh = spawn(move || assert_eq!(x.0, "msg"));
        assert_eq!(y.0, "msg");
        jh.join().unwrap();

        // x is dropped by now, but not y
        assert_eq!(0, NUM_DROPS.load(Relaxed));
        drop(y);
        assert_eq!(1, NUM_DROPS.load(Relaxed));
    }

    #[test]
    fn acquire_release_pair() {
        let x: RefCounted<i32> = RefCounted::new(5);
        let y = RefCounted::acquire(&x);
        assert_eq!(RefCounted::count(&x), 2);
        assert_eq!(RefCounted::release(y), None);
        assert_eq!(RefCounted::count(&x), 1);
        assert_eq!(RefCounted::release(x), Some(5));
    }

    #[test]
    fn branches_per_release() {
        let alive = Cell::new(0);
        let destroyed = Cell::new(0);
        let x: RefCounted<String, Cell<usize>> = RefCounted::new("payload".to_string());

        let acquired = Cell::new(0);
        let mut handles: Vec<_> = (0..3)
            .map(|_| RefCounted::acquire_with(Some(&x), |_| acquired.set(acquired.get() + 1)).unwrap())
            .collect();
        assert_eq!(acquired.get(), 3);
        handles.push(x);

        let last = handles.len() - 1;
        for (i, h) in handles.into_iter().enumerate() {
            RefCounted::release_with(
                Some(h),
                |payload| {
                    assert_eq!(payload, "payload");
                    destroyed.set(destroyed.get() + 1)
                },
                || alive.set(alive.get() + 1),
            );
            assert_eq!(destroyed.get(), usize::from(i == last));
        }
        assert_eq!((alive.get(), destroyed.get()), (3, 1));
    }

    #[test]
    fn none_runs_no_branch() {
        let ran = Cell::new(false);
        let acquired = RefCounted::<u8, AtomicUsize>::acquire_with(None, |_| ran.set(true));
        assert!(acquired.is_none());
        let released = RefCounted::<u8, AtomicUsize>::release_with(None, |_| ran.set(true), || ran.set(true));
        assert!(released.is_none());
        assert!(!ran.get());
    }

    #[test]
    fn one_destroy_across_threads() {
        const THREADS: usize = 8;
        let drops = AtomicUsize::new(0);
        let destroys = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);

        let root: RefCounted<_> = RefCounted::new(DetectDrop(&drops));
        scope(|s| {
            for _ in 0..THREADS {
                let mine = RefCounted::acquire(&root);
                s.spawn(|| {
                    let mine = mine;
                    barrier.wait();
                    let extra = RefCounted::acquire(&mine);
                    for h in [extra, mine] {
                        if RefCounted::release(h).is_some() {
                            destroys.fetch_add(1, Relaxed);
                        }
                    }
                });
            }
            // the root goes last or races the threads, either way a single zero
            if RefCounted::release(root).is_some() {
                destroys.fetch_add(1, Relaxed);
            }
        });
        assert_eq!(destroys.load(Relaxed), 1);
        assert_eq!(drops.load(Relaxed), 1);
    }

    #[test]
    fn get_mut_only_when_unique() {
        let mut x: RefCounted<Vec<u8>> = RefCounted::new(vec![]);
        let y = x.clone();
        assert!(RefCounted::get_mut(&mut x).is_none());
        drop(y);
        RefCounted::get_mut(&mut x).unwrap().push(1);
        assert_eq!(*x, [1]);
    }
}
