//! # Synchronized sections
//!
//! Plain critical sections, no data attached:
//! - [synchronize_with] - run a closure under a given [RawMutex]
//! - [synchronize_if_with] - same, picking one of two closures by a condition evaluated under the lock
//! - [synchronized!](crate::synchronized) - a block under a mutex private to that spot in the code
//! - [synchronized_if!](crate::synchronized_if) - same, with a condition checked under that mutex and an optional `else` block
//! - [RunOnce] and [run_once!](crate::run_once) - a block run by the first caller only, with an optional branch for the rest
//!
//! The unlock is always a guard's [Drop] => it runs on return, `?`, `break` and panics.
//! The macros expand to a block with a `static` inside, so every expansion site gets its own mutex,
//! and the block body keeps its control flow (`return` returns from the enclosing function).

use std::sync::atomic::{
    AtomicBool,
    Ordering::{Acquire, Relaxed, Release},
};

use log::trace;

use crate::env::{FutexMutex, RawGuard, RawMutex};

/// Runs `body` with `mutex` locked
pub fn synchronize_with<M: RawMutex, R>(mutex: &M, body: impl FnOnce() -> R) -> R {
    let _guard = RawGuard::lock(mutex);
    body()
}

/// Locks `mutex` (if any, `None` runs right away), then runs `then` if `cond` holds and `otherwise` if not.
/// The condition and both branches are evaluated under the lock.
pub fn synchronize_if_with<M: RawMutex, R>(
    mutex: Option<&M>,
    cond: impl FnOnce() -> bool,
    then: impl FnOnce() -> R,
    otherwise: impl FnOnce() -> R,
) -> R {
    let _guard = mutex.map(RawGuard::lock);
    if cond() {
        then()
    } else {
        otherwise()
    }
}

/// Runs the following block under a static mutex owned by this expansion site.
///
/// ```
/// fn next_id() -> u64 {
///     static mut NEXT: u64 = 0;
///     cmx::synchronized! {
///         // SAFETY: NEXT is only touched in this section
///         unsafe {
///             NEXT += 1;
///             NEXT
///         }
///     }
/// }
/// assert_eq!(next_id(), 1);
/// assert_eq!(next_id(), 2);
/// ```
#[macro_export]
macro_rules! synchronized {
    ($($body:tt)*) => {{
        static SECTION: $crate::env::FutexMutex = $crate::env::FutexMutex::new();
        let _section = $crate::env::RawGuard::lock(&SECTION);
        $($body)*
    }};
}

/// Locks a static mutex owned by this expansion site, then checks the condition and runs one of the blocks.
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
///
/// static READY: AtomicBool = AtomicBool::new(false);
/// fn prepare() -> &'static str {
///     cmx::synchronized_if!(!READY.load(Relaxed), {
///         READY.store(true, Relaxed);
///         "prepared"
///     } else {
///         "already prepared"
///     })
/// }
/// assert_eq!(prepare(), "prepared");
/// assert_eq!(prepare(), "already prepared");
/// ```
#[macro_export]
macro_rules! synchronized_if {
    ($cond:expr, $then:block else $otherwise:block) => {{
        static SECTION: $crate::env::FutexMutex = $crate::env::FutexMutex::new();
        let _section = $crate::env::RawGuard::lock(&SECTION);
        if $cond $then else $otherwise
    }};
    ($cond:expr, $then:block) => {{
        static SECTION: $crate::env::FutexMutex = $crate::env::FutexMutex::new();
        let _section = $crate::env::RawGuard::lock(&SECTION);
        if $cond $then
    }};
}

/// A block to be run once.
///
/// `run` is synchronized: concurrent first callers queue up, exactly one of them runs `first`,
/// the others run `otherwise` once it's done. Later calls skip the lock altogether.
pub struct RunOnce<M: RawMutex = FutexMutex> {
    done: AtomicBool,
    lock: M,
}

impl RunOnce<FutexMutex> {
    /// const => usable in a `static`
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            lock: FutexMutex::new(),
        }
    }
}

impl Default for RunOnce<FutexMutex> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> RunOnce<M> {
    pub fn with_mutex(lock: M) -> Self {
        Self {
            done: AtomicBool::new(false),
            lock,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Acquire)
    }

    /// `first` on the very first call, `otherwise` on every other
    pub fn run<R>(&self, first: impl FnOnce() -> R, otherwise: impl FnOnce() -> R) -> R {
        // Acquire pairs with the Release below => the effects of `first` are visible to the fast path
        if self.done.load(Acquire) {
            return otherwise();
        }
        let _guard = RawGuard::lock(&self.lock);
        if self.done.load(Relaxed) {
            otherwise()
        } else {
            // marked before running => a panic in `first` doesn't make it run twice
            self.done.store(true, Release);
            trace!("running a once-only block");
            first()
        }
    }

    /// `true` if `first` ran
    pub fn call_once(&self, first: impl FnOnce()) -> bool {
        self.run(
            || {
                first();
                true
            },
            || false,
        )
    }
}

/// Runs the block the first time control gets here, and the optional `else` block every other time.
///
/// ```
/// fn init() -> &'static str {
///     cmx::run_once! {
///         { "initialized" } else { "skipped" }
///     }
/// }
/// assert_eq!(init(), "initialized");
/// assert_eq!(init(), "skipped");
/// ```
#[macro_export]
macro_rules! run_once {
    ($first:block else $otherwise:block) => {{
        static ONCE: $crate::synchronize::RunOnce = $crate::synchronize::RunOnce::new();
        ONCE.run(|| $first, || $otherwise)
    }};
    ($first:block) => {{
        static ONCE: $crate::synchronize::RunOnce = $crate::synchronize::RunOnce::new();
        ONCE.call_once(|| $first);
    }};
}

pub fn run() {
    fn greet(name: &str) {
        run_once! {
            { println!("first visitor: {name}") }
            else { println!("welcome back, {name}") }
        }
    }

    std::thread::scope(|s| {
        for name in ["ann", "bob", "cyd"] {
            s.spawn(move || greet(name));
        }
    });

    let log = std::cell::RefCell::new(Vec::new());
    let mutex = FutexMutex::new();
    for n in 0..4 {
        synchronize_if_with(
            Some(&mutex),
            || n % 2 == 0,
            || log.borrow_mut().push(format!("{n} is even")),
            || log.borrow_mut().push(format!("{n} is odd")),
        );
    }
    println!("{:?}", log.borrow());
}
