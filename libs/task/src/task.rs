// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use std::sync::Arc;

/// Lifecycle of a task between submissions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum TaskStatus {
    /// Never submitted, or reset for the next submission.
    Init = 0,
    /// Submitted; ranges are being claimed and executed.
    Exec = 1,
    /// All of `[0, worksize)` has executed; awaiters may return.
    Complete = 2,
}

impl TaskStatus {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Init,
            1 => Self::Exec,
            2 => Self::Complete,
            _ => unreachable!("corrupt task status"),
        }
    }
}

/// The work body of a task: called with disjoint `[begin, end)` ranges that
/// together partition `[0, worksize)`, concurrently from many workers.
pub trait Work: Send + Sync + 'static {
    fn execute(&self, begin: i32, end: i32);
}

impl<F> Work for F
where
    F: Fn(i32, i32) + Send + Sync + 'static,
{
    fn execute(&self, begin: i32, end: i32) {
        self(begin, end)
    }
}

/// The atomic control block every task carries.
///
/// `head` is the claim cursor (grows past `worksize`), `tail` the completed
/// count (reaches exactly `worksize`), `awaits` the number of threads inside
/// [`Scheduler::await_task`](crate::Scheduler::await_task).
pub(crate) struct Header {
    pub(crate) status: AtomicU32,
    pub(crate) worksize: AtomicI32,
    pub(crate) granularity: AtomicI32,
    pub(crate) head: AtomicI32,
    pub(crate) tail: AtomicI32,
    pub(crate) awaits: AtomicI32,
}

// === impl Header ===

impl Header {
    fn new() -> Self {
        Self {
            status: AtomicU32::new(TaskStatus::Init as u32),
            worksize: AtomicI32::new(0),
            granularity: AtomicI32::new(1),
            head: AtomicI32::new(0),
            tail: AtomicI32::new(0),
            awaits: AtomicI32::new(0),
        }
    }

    #[inline]
    pub(crate) fn status(&self) -> TaskStatus {
        TaskStatus::from_raw(self.status.load(Ordering::Acquire))
    }
}

pub(crate) struct Task {
    pub(crate) header: Header,
    pub(crate) work: Box<dyn Work>,
}

/// A cheaply clonable reference to a reusable task.
///
/// The task pairs its control block with a boxed [`Work`] body. Submitting
/// pushes one reference into every worker inbox; the submitter keeps its own
/// and may resubmit once the previous run has been awaited.
#[derive(Clone)]
pub struct TaskRef(Arc<Task>);

// === impl TaskRef ===

impl TaskRef {
    /// Wraps a [`Work`] impl into a submit-ready task.
    #[must_use]
    pub fn new(work: impl Work) -> Self {
        Self(Arc::new(Task {
            header: Header::new(),
            work: Box::new(work),
        }))
    }

    /// Convenience for closure bodies.
    #[must_use]
    pub fn from_fn(work: impl Fn(i32, i32) + Send + Sync + 'static) -> Self {
        Self::new(work)
    }

    /// The task's current lifecycle phase.
    #[inline]
    pub fn status(&self) -> TaskStatus {
        self.0.header.status()
    }

    #[inline]
    pub(crate) fn header(&self) -> &Header {
        &self.0.header
    }

    #[inline]
    pub(crate) fn task(&self) -> &Task {
        &self.0
    }

    /// Identity of the underlying task, for re-entrancy checks.
    #[inline]
    pub(crate) fn as_ptr(&self) -> *const Task {
        Arc::as_ptr(&self.0)
    }

    /// Leaks one reference as a raw pointer for inbox transport.
    pub(crate) fn into_raw(self) -> NonNull<Task> {
        // Safety: Arc::into_raw never returns null
        unsafe { NonNull::new_unchecked(Arc::into_raw(self.0).cast_mut()) }
    }

    /// Reclaims a reference leaked by [`into_raw`](Self::into_raw).
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `into_raw` and be reclaimed exactly once.
    pub(crate) unsafe fn from_raw(ptr: NonNull<Task>) -> Self {
        // Safety: ensured by caller
        Self(unsafe { Arc::from_raw(ptr.as_ptr()) })
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        f.debug_struct("TaskRef")
            .field("status", &self.status())
            .field("worksize", &header.worksize.load(Ordering::Relaxed))
            .field("tail", &header.tail.load(Ordering::Relaxed))
            .field("awaits", &header.awaits.load(Ordering::Relaxed))
            .finish()
    }
}
