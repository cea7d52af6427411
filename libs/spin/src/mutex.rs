// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::{fmt, mem};

use util::loom_const_fn;

use crate::Backoff;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicI32, Ordering};

const UNLOCKED: i32 = 0;
const LOCKED: i32 = -1;

/// A busy-waiting mutual exclusion primitive.
///
/// The lock word holds `0` when free and `-1` when held; acquisition is a
/// single compare-exchange with acquire ordering, and contended callers back
/// off with a growing [`Backoff`]. Intended for short critical sections such
/// as the shared allocator pools; anything that can block for longer belongs
/// on a blocking lock.
pub struct Spinlock<T: ?Sized> {
    state: AtomicI32,
    data: UnsafeCell<T>,
}

/// An RAII implementation of a "scoped lock" of a spinlock. When this
/// structure is dropped (falls out of scope), the lock will be unlocked.
#[clippy::has_significant_drop]
#[must_use = "if unused the Spinlock will immediately unlock"]
pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
    marker: PhantomData<&'a mut T>,
}

/// A [`Spinlock<()>`], usable as a `lock_api::RawMutex` implementation.
pub type RawSpinlock = Spinlock<()>;

// Safety: the lock word serializes access to the data
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
// Safety: the lock word serializes access to the data
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

// === impl Spinlock ===

impl<T> Spinlock<T> {
    loom_const_fn! {
        pub const fn new(data: T) -> Spinlock<T> {
            Spinlock {
                state: AtomicI32::new(UNLOCKED),
                data: UnsafeCell::new(data),
            }
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Spinlock<T> {
    /// Creates a new `SpinlockGuard` without checking if the lock is held.
    ///
    /// # Safety
    ///
    /// This method must only be called if the thread logically holds the lock.
    #[inline]
    unsafe fn make_guard_unchecked(&self) -> SpinlockGuard<'_, T> {
        SpinlockGuard {
            lock: self,
            marker: PhantomData,
        }
    }

    /// Acquires the lock, busy-waiting with adaptive back-off until it is
    /// available.
    #[inline]
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let mut boff = Backoff::new();
        while !self.try_lock_internal() {
            boff.spin();
        }

        // Safety: the lock is held, as required.
        unsafe { self.make_guard_unchecked() }
    }

    /// Attempts to acquire this lock without spinning.
    ///
    /// Returns `None` if the lock is currently held by another thread.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self.try_lock_internal() {
            // Safety: the lock is held, as required.
            Some(unsafe { self.make_guard_unchecked() })
        } else {
            None
        }
    }

    #[inline]
    fn try_lock_internal(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Checks whether the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Spinlock` mutably, no actual locking needs
    /// to take place.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        // Safety: we hold a mutable reference to the lock, so no guard exists
        self.data.with_mut(|data| unsafe { &mut *data })
    }

    /// Forcibly releases the lock.
    ///
    /// # Safety
    ///
    /// This method must only be called if the current thread logically owns a
    /// `SpinlockGuard` but that guard has been discarded using `mem::forget`.
    #[inline]
    pub unsafe fn force_unlock(&self) {
        let prev = self.state.swap(UNLOCKED, Ordering::Release);
        debug_assert_eq!(prev, LOCKED, "released a spinlock that was not held");
    }
}

impl<T: Default> Default for Spinlock<T> {
    #[inline]
    fn default() -> Spinlock<T> {
        Spinlock::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Spinlock").field("data", &&*guard).finish(),
            None => f.debug_struct("Spinlock").field("data", &"<locked>").finish(),
        }
    }
}

// === impl SpinlockGuard ===

impl<'a, T: ?Sized + 'a> Deref for SpinlockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds the lock, so access to the data is exclusive
        self.lock.data.with(|data| unsafe { &*data })
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for SpinlockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock, so access to the data is exclusive
        self.lock.data.with_mut(|data| unsafe { &mut *data })
    }
}

impl<'a, T: ?Sized + 'a> Drop for SpinlockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: a SpinlockGuard always holds the lock.
        unsafe {
            self.lock.force_unlock();
        }
    }
}

impl<'a, T: fmt::Debug + ?Sized + 'a> fmt::Debug for SpinlockGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(not(loom))]
// Safety: lock/unlock follow the RawMutex protocol; the guard marker is Send
// because the lock word is not tied to a particular thread.
unsafe impl lock_api::RawMutex for RawSpinlock {
    #[allow(clippy::declare_interior_mutable_const, reason = "required by lock_api")]
    const INIT: Self = Spinlock::new(());
    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        let guard = Spinlock::lock(self);
        mem::forget(guard);
    }

    fn try_lock(&self) -> bool {
        let guard = Spinlock::try_lock(self);
        let ret = guard.is_some();
        mem::forget(guard);
        ret
    }

    unsafe fn unlock(&self) {
        // Safety: ensured by caller
        unsafe {
            Spinlock::force_unlock(self);
        }
    }

    fn is_locked(&self) -> bool {
        Spinlock::is_locked(self)
    }
}
