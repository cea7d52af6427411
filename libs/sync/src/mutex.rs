// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The blocking mutex used for longer critical sections such as per-slab
//! mutation.
//!
//! This is `parking_lot`'s word-sized lock re-exported under the engine's
//! names; the original's trick of embedding an OS critical-section record in
//! a fixed byte buffer has no equivalent worth keeping here.

pub type Mutex<T> = parking_lot::Mutex<T>;
pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;
