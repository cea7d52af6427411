// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicI32, Ordering};

use spin::Backoff;

use crate::Semaphore;

/// An edge-triggered wake-up event with a sleeper count.
///
/// The state word is interpreted as: positive = pending wakes that will let
/// the next waiters straight through, zero = idle, negative = number of
/// threads currently asleep on the internal semaphore. A wake that arrives
/// while nobody sleeps is remembered (saturating at one for [`wake_one`],
/// at the sleeper count for [`wake_all`]), so wake/wait races never lose a
/// notification.
///
/// [`wake_one`]: Self::wake_one
/// [`wake_all`]: Self::wake_all
pub struct Event {
    state: AtomicI32,
    sema: Semaphore,
}

// === impl Event ===

impl Event {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(0),
            sema: Semaphore::new(0),
        }
    }

    /// Waits for the event to be signaled.
    ///
    /// Consumes one pending wake if any, otherwise blocks until a wake
    /// arrives.
    pub fn wait(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        if prev < 1 {
            self.sema.wait();
        }
    }

    /// Wakes one sleeper, or leaves one pending wake if nobody sleeps.
    pub fn wake_one(&self) {
        let mut boff = Backoff::new();
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            let new = if old < 1 { old + 1 } else { 1 };
            match self
                .state
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => old = observed,
            }
            boff.spin();
        }
        if old < 0 {
            self.sema.signal(1);
        }
    }

    /// Wakes every current sleeper.
    ///
    /// The state is flipped to `max(1, -prior)`: every observed sleeper gets
    /// a permit, and one wake stays pending for the next waiter if the event
    /// was idle.
    pub fn wake_all(&self) {
        let mut boff = Backoff::new();
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            let new = (-old).max(1);
            match self
                .state
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => old = observed,
            }
            boff.spin();
        }
        if old < 0 {
            self.sema.signal(usize::try_from(-old).expect("sleeper count"));
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> i32 {
        self.state.load(Ordering::Acquire)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
