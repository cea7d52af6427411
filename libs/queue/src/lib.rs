// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded ring queues for the engine core: the MPMC [`PtrQueue`] backing
//! scheduler inboxes, and the single-owner [`IntQueue`] backing id free
//! lists.

mod int_queue;
mod ptr_queue;

pub use int_queue::IntQueue;
pub use ptr_queue::{Full, PtrQueue};
