//! Channel and peer state is guarded by short critical sections that never await. The
//!  primitive used for this is pluggable: [BlockingLock] parks contending threads on a
//!  `std::sync::Mutex`, [SpinLock] busy-waits on an atomic flag, which can be faster when
//!  critical sections are tiny and workers are pinned to cores.

use std::cell::UnsafeCell;
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

pub trait LockStrategy: Send + Sync + 'static {
    type Lock<T: Send>: Send + Sync;

    fn new_lock<T: Send>(value: T) -> Self::Lock<T>;

    fn with_lock<T: Send, R>(lock: &Self::Lock<T>, f: impl FnOnce(&mut T) -> R) -> R;
}

pub struct BlockingLock;

impl LockStrategy for BlockingLock {
    type Lock<T: Send> = Mutex<T>;

    fn new_lock<T: Send>(value: T) -> Self::Lock<T> {
        Mutex::new(value)
    }

    fn with_lock<T: Send, R>(lock: &Self::Lock<T>, f: impl FnOnce(&mut T) -> R) -> R {
        // a panic while holding the lock leaves plain data behind, so we continue with it
        let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

pub struct SpinLock;

impl LockStrategy for SpinLock {
    type Lock<T: Send> = SpinMutex<T>;

    fn new_lock<T: Send>(value: T) -> Self::Lock<T> {
        SpinMutex::new(value)
    }

    fn with_lock<T: Send, R>(lock: &Self::Lock<T>, f: impl FnOnce(&mut T) -> R) -> R {
        lock.with(f)
    }
}

pub struct SpinMutex<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// access to `value` is serialized through `locked`
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub fn new(value: T) -> SpinMutex<T> {
        SpinMutex {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        while self.locked.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }

        let _unlock = SpinUnlock(&self.locked);
        f(unsafe { &mut *self.value.get() })
    }
}

/// releases the flag on drop, so a panicking closure does not leave the lock taken
struct SpinUnlock<'a>(&'a AtomicBool);
impl Drop for SpinUnlock<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
