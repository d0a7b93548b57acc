//! # Shareable values
//!
//! Most instances of a struct never leave their thread, a few get shared. Paying for a mutex on every access
//! of every instance is wasteful, so a [Shareable] starts without one and gets it on request:
//!
//! ```text
//!     Unshared --enable()--> Shared
//! ```
//!
//! The transition happens once and is never undone. [Shareable::synchronized] checks the state on every call:
//! - unshared - the body runs as is, the mutex is not even initialized
//! - shared - the body runs between lock and unlock, the unlock sits in a guard's [Drop] so early returns and panics unlock too
//!
//! ## Enabling
//! The upgrade is a compare-and-swap on the state, so racing `enable` calls agree on a single winner.
//! There's a short-lived third state, `ENABLING`, while the winner initializes the mutex;
//! anyone who sees it spins until the mutex is published with the `SHARED` store.
//!
//! Still, `enable` is meant to happen-before the concurrent use, e.g. right before handing the value to other threads.
//!
//! ## Unshared access
//! `synchronized` takes `&self` but hands out `&mut T`. Without a lock, two overlapping calls would alias.
//! So the unshared path marks the value busy with a single atomic swap, and an overlapping access
//! (another thread, or the body calling back into the same value) panics, the same way [std::cell::RefCell] does.
//! Shared-path holders wait for unshared stragglers that entered just before the upgrade.
//!
//! The usual layout is a public synchronized API over a private unsynchronized one:
//! ```
//! use cmx::shareable::Shareable;
//!
//! struct Stats { hits: u64 }
//!
//! pub struct Service { stats: Shareable<Stats> }
//!
//! impl Service {
//!     fn hit_unsynchronized(stats: &mut Stats) -> u64 {
//!         stats.hits += 1;
//!         stats.hits
//!     }
//!
//!     pub fn hit(&self) -> u64 {
//!         self.stats.synchronized(Self::hit_unsynchronized)
//!     }
//!
//!     pub fn share(&self) -> &Self {
//!         self.stats.enable();
//!         self
//!     }
//! }
//!
//! let service = Service { stats: Shareable::new(Stats { hits: 0 }) };
//! assert_eq!(service.hit(), 1);
//! std::thread::scope(|s| {
//!     let service = service.share();
//!     s.spawn(|| service.hit());
//!     s.spawn(|| service.hit());
//! });
//! assert_eq!(service.hit(), 4);
//! ```

use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    mem::MaybeUninit,
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicBool, AtomicU8,
        Ordering::{Acquire, Relaxed, Release},
    },
};

use log::trace;
use strum_macros::{Display, IntoStaticStr};

use crate::env::{FutexMutex, RawMutex};

const UNSHARED: u8 = 0;
const ENABLING: u8 = 1;
const SHARED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ShareState {
    Unshared,
    Shared,
}

pub struct Shareable<T, M: RawMutex = FutexMutex> {
    state: AtomicU8,
    /// a body is running on the value right now
    busy: AtomicBool,
    /// initialized iff state == SHARED
    mutex: UnsafeCell<MaybeUninit<M>>,
    value: UnsafeCell<T>,
}

// same promises as a Mutex<T>: sharing it only ever lets one thread at a time reach T
unsafe impl<T: Send, M: RawMutex + Send> Send for Shareable<T, M> {}
unsafe impl<T: Send, M: RawMutex + Send + Sync> Sync for Shareable<T, M> {}

impl<T, M: RawMutex> Shareable<T, M> {
    /// Unshared, the mutex is left uninitialized
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU8::new(UNSHARED),
            busy: AtomicBool::new(false),
            mutex: UnsafeCell::new(MaybeUninit::uninit()),
            value: UnsafeCell::new(value),
        }
    }

    pub fn state(&self) -> ShareState {
        match self.state.load(Acquire) {
            SHARED => ShareState::Shared,
            _ => ShareState::Unshared,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.state() == ShareState::Shared
    }

    /// Turns the locking on. `true` if this call did the upgrade, `false` if it was already on.
    pub fn enable(&self) -> bool {
        self.enable_with(|| true, || false)
    }

    /// Runs `on_first` for the call that did the upgrade, `on_already` for every other one.
    /// Either way the value is shared when the branch runs.
    pub fn enable_with<R>(&self, on_first: impl FnOnce() -> R, on_already: impl FnOnce() -> R) -> R {
        match self.state.compare_exchange(UNSHARED, ENABLING, Acquire, Acquire) {
            Ok(_) => {
                // SAFETY: ENABLING is ours alone, nobody reads the mutex before SHARED
                unsafe { (*self.mutex.get()).write(M::new()) };
                // Release pairs with the Acquire loads in `lock` => the mutex is seen initialized
                self.state.store(SHARED, Release);
                trace!("{} -> {}", ShareState::Unshared, ShareState::Shared);
                on_first()
            }
            Err(_) => {
                while self.state.load(Acquire) != SHARED {
                    std::hint::spin_loop();
                }
                on_already()
            }
        }
    }

    /// The mutex, once there is one
    pub fn raw_mutex(&self) -> Option<&M> {
        match self.state.load(Acquire) {
            // SAFETY: SHARED is published after the mutex is written
            SHARED => Some(unsafe { (*self.mutex.get()).assume_init_ref() }),
            _ => None,
        }
    }

    /// Access to the value, locked if shared.
    ///
    /// # Panics
    /// If the value is unshared and another access is in progress.
    pub fn lock(&self) -> Access<'_, T, M> {
        loop {
            match self.state.load(Acquire) {
                SHARED => {
                    // SAFETY: see raw_mutex
                    let mutex = unsafe { (*self.mutex.get()).assume_init_ref() };
                    mutex.lock();
                    // only an unshared straggler can hold it, and it's about to finish
                    while self.busy.swap(true, Acquire) {
                        std::hint::spin_loop();
                    }
                    return Access {
                        shareable: self,
                        locked: Some(mutex),
                        _not_send: PhantomData,
                    };
                }
                ENABLING => std::hint::spin_loop(),
                _ => {
                    if !self.busy.swap(true, Acquire) {
                        return Access {
                            shareable: self,
                            locked: None,
                            _not_send: PhantomData,
                        };
                    }
                    if self.state.load(Acquire) == UNSHARED {
                        panic!("unshared value accessed from overlapping contexts, enable() it before sharing");
                    }
                    // enabled meanwhile, the holder is a locked access => take the locked path
                }
            }
        }
    }

    /// Runs `body` on the value, between lock and unlock if shared, as is otherwise.
    pub fn synchronized<R>(&self, body: impl FnOnce(&mut T) -> R) -> R {
        let mut access = self.lock();
        body(&mut *access)
    }

    /// `&mut self` proves nobody else is looking, no locking needed
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        let this = std::mem::ManuallyDrop::new(self);
        if this.state.load(Relaxed) == SHARED {
            // SAFETY: shared => initialized; `this` is never dropped
            unsafe { (*this.mutex.get()).assume_init_drop() };
        }
        // SAFETY: the value is moved out exactly once and `this` is never dropped
        unsafe { std::ptr::read(this.value.get()) }
    }
}

impl<T: Default, M: RawMutex> Default for Shareable<T, M> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, M: RawMutex> Drop for Shareable<T, M> {
    fn drop(&mut self) {
        if *self.state.get_mut() == SHARED {
            // SAFETY: shared => initialized
            unsafe { self.mutex.get_mut().assume_init_drop() };
        }
    }
}

/// Makes `ptr` shared, returns its argument. `None` is a no-op.
pub fn share<T, M: RawMutex>(ptr: Option<&Shareable<T, M>>) -> Option<&Shareable<T, M>> {
    if let Some(shareable) = ptr {
        shareable.enable();
    }
    ptr
}

/// [Shareable::synchronized] for an optional value. `None` means nothing to protect: the body doesn't run.
pub fn synchronized<T, M: RawMutex, R>(
    ptr: Option<&Shareable<T, M>>,
    body: impl FnOnce(&mut T) -> R,
) -> Option<R> {
    ptr.map(|shareable| shareable.synchronized(body))
}

/// The value, while it's being accessed.
///
/// Same rules as a [std::sync::MutexGuard]: it stays on the thread that locked,
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<cmx::shareable::Access<'static, u64, cmx::env::FutexMutex>>();
/// ```
/// and sharing it between threads needs `T: Sync`, as both sides reach `&T` without locking again:
/// ```compile_fail
/// fn assert_sync<T: Sync>() {}
/// assert_sync::<cmx::shareable::Access<'static, std::cell::Cell<u64>, cmx::env::FutexMutex>>();
/// ```
pub struct Access<'a, T, M: RawMutex> {
    shareable: &'a Shareable<T, M>,
    locked: Option<&'a M>,
    // !Send, !Sync unless opted in below
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: Sync, M: RawMutex + Sync> Sync for Access<'_, T, M> {}

impl<T, M: RawMutex> Access<'_, T, M> {
    pub fn is_locked(&self) -> bool {
        self.locked.is_some()
    }
}

impl<T, M: RawMutex> Deref for Access<'_, T, M> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the busy flag is ours while the access lives
        unsafe { &*self.shareable.value.get() }
    }
}

impl<T, M: RawMutex> DerefMut for Access<'_, T, M> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the busy flag is ours while the access lives
        unsafe { &mut *self.shareable.value.get() }
    }
}

impl<T, M: RawMutex> Drop for Access<'_, T, M> {
    fn drop(&mut self) {
        self.shareable.busy.store(false, Release);
        if let Some(mutex) = self.locked {
            // SAFETY: locked in `lock`, the references handed out die with the access
            unsafe { mutex.unlock() };
        }
    }
}

pub fn run() {
    let log: Shareable<Vec<String>> = Shareable::new(Vec::new());

    log.synchronized(|lines| lines.push("written without a lock".into()));
    println!("shared after construction: {}", log.state());

    if share(Some(&log)).is_some_and(|l| l.is_shared()) {
        println!("now {}", log.state());
    }
    println!("enable again reports first time: {}", log.enable());

    std::thread::scope(|s| {
        for t in 0..3 {
            let log = &log;
            s.spawn(move || log.synchronized(|lines| lines.push(format!("written by thread {t}"))));
        }
    });
    for line in log.into_inner() {
        println!("{line}");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::env::Instrumented;
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::Barrier,
        thread::scope,
    };

    type Probed<T> = Shareable<T, Instrumented<FutexMutex>>;

    #[test]
    fn unshared_never_touches_the_mutex() {
        let s = Probed::new(0);
        for _ in 0..10 {
            s.synchronized(|v| *v += 1);
        }
        assert_eq!(s.state(), ShareState::Unshared);
        assert!(s.raw_mutex().is_none());
        assert_eq!(s.into_inner(), 10);
    }

    #[test]
    fn scenario() {
        let s = Probed::new(String::new());

        let locked = s.synchronized(|v| {
            v.push('a');
            s.raw_mutex().is_some()
        });
        assert!(!locked);

        assert!(s.enable());
        assert!(!s.enable());
        let mutex = s.raw_mutex().unwrap();
        assert_eq!((mutex.locks(), mutex.unlocks()), (0, 0));

        s.synchronized(|v| {
            assert!(mutex.is_held());
            assert_eq!(mutex.locks(), 1);
            v.push('b');
        });
        assert_eq!((mutex.locks(), mutex.unlocks()), (1, 1));
        assert_eq!(s.into_inner(), "ab");
    }

    #[test]
    fn enable_branches() {
        let s = Probed::new(());
        let calls: Vec<_> = (0..3).map(|_| s.enable_with(|| "first", || "already")).collect();
        assert_eq!(calls, ["first", "already", "already"]);
    }

    #[test]
    fn unlocks_on_early_exit() {
        fn checked_add(s: &Probed<u32>, n: u32) -> Result<u32, &'static str> {
            s.synchronized(|v| -> Result<u32, &'static str> {
                *v = v.checked_add(n).ok_or("overflow")?;
                Ok(*v)
            })
        }

        let s = Probed::new(u32::MAX - 1);
        s.enable();
        assert_eq!(checked_add(&s, 1), Ok(u32::MAX));
        assert_eq!(checked_add(&s, 1), Err("overflow"));
        let mutex = s.raw_mutex().unwrap();
        assert_eq!((mutex.locks(), mutex.unlocks()), (2, 2));
    }

    #[test]
    fn unlocks_on_panic() {
        let s = Probed::new(0);
        s.enable();
        let result = catch_unwind(AssertUnwindSafe(|| s.synchronized(|_| panic!("boom"))));
        assert!(result.is_err());
        let mutex = s.raw_mutex().unwrap();
        assert!(!mutex.is_held());
        // still usable
        s.synchronized(|v| *v += 1);
        assert_eq!((mutex.locks(), mutex.unlocks()), (2, 2));
    }

    #[test]
    fn unshared_panic_releases_busy() {
        let s = Probed::new(0);
        let result = catch_unwind(AssertUnwindSafe(|| s.synchronized(|_| panic!("boom"))));
        assert!(result.is_err());
        s.synchronized(|v| *v = 1);
        assert_eq!(s.into_inner(), 1);
    }

    #[test]
    fn overlapping_unshared_access_panics() {
        let s = Probed::new(0);
        let result = catch_unwind(AssertUnwindSafe(|| s.synchronized(|_| s.synchronized(|_| ()))));
        assert!(result.is_err());
        // the outer access was unwound properly
        assert_eq!(s.synchronized(|v| *v), 0);
    }

    #[test]
    fn none_skips_the_body() {
        let mut ran = false;
        assert!(synchronized::<u8, FutexMutex, _>(None, |_| ran = true).is_none());
        assert!(!ran);
        assert!(share::<u8, FutexMutex>(None).is_none());
    }

    #[test]
    fn racing_enables_agree() {
        const THREADS: usize = 8;
        let s = Probed::new(());
        let barrier = Barrier::new(THREADS);
        let winners = scope(|sc| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    sc.spawn(|| {
                        barrier.wait();
                        s.enable()
                    })
                })
                .collect();
            handles.into_iter().filter_map(|h| h.join().unwrap().then_some(())).count()
        });
        assert_eq!(winners, 1);
        assert!(s.is_shared());
    }

    #[test]
    fn shared_counts_every_increment() {
        let s = Probed::new(0usize);
        assert!(share(Some(&s)).is_some());
        scope(|sc| {
            for _ in 0..4 {
                sc.spawn(|| {
                    for _ in 0..1000 {
                        s.synchronized(|v| *v += 1);
                    }
                });
            }
        });
        let mutex = s.raw_mutex().unwrap();
        assert_eq!((mutex.locks(), mutex.unlocks()), (4000, 4000));
        assert_eq!(s.into_inner(), 4000);
    }

    #[test]
    fn shared_drop_releases_mutex() {
        #[cfg(unix)]
        {
            let s = Shareable::<_, crate::env::PthreadMutex>::new(vec![1]);
            s.enable();
            s.synchronized(|v| v.push(2));
            drop(s);
        }
        let s = Shareable::<_, crate::env::SpinMutex>::new(vec![1]);
        s.enable();
        assert_eq!(s.into_inner(), [1]);
    }

    #[test]
    fn access_shares_only_sync_values() {
        fn assert_sync<T: Sync>() {}
        assert_sync::<Access<'_, u64, FutexMutex>>();
        assert_sync::<Access<'_, Vec<String>, Instrumented<FutexMutex>>>();
        // Cell values and sending are rejected at compile time, see the examples on Access
    }

    #[test]
    fn state_names() {
        assert_eq!(ShareState::Unshared.to_string(), "unshared");
        let shared: &'static str = ShareState::Shared.into();
        assert_eq!(shared, "shared");
    }
}
