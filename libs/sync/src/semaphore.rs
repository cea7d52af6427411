// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore.
///
/// `wait` takes a permit, blocking while none are available; `signal` hands
/// out `n` permits at once. This is the blocking foundation the [`Event`],
/// [`Barrier`] and [`RwLock`] primitives are built on.
///
/// [`Event`]: crate::Event
/// [`Barrier`]: crate::Barrier
/// [`RwLock`]: crate::RwLock
pub struct Semaphore {
    permits: Mutex<usize>,
    cvar: Condvar,
}

// === impl Semaphore ===

impl Semaphore {
    #[must_use]
    pub const fn new(initial: usize) -> Self {
        Self {
            permits: Mutex::new(initial),
            cvar: Condvar::new(),
        }
    }

    /// Releases `n` permits, waking up to `n` blocked waiters.
    pub fn signal(&self, n: usize) {
        if n == 0 {
            return;
        }

        let mut permits = self.permits.lock();
        *permits += n;
        if n == 1 {
            self.cvar.notify_one();
        } else {
            self.cvar.notify_all();
        }
    }

    /// Takes one permit, blocking until one is available.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cvar.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Takes one permit if immediately available.
    #[must_use]
    pub fn try_wait(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }
}
