// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use std::sync::Arc;
use std::thread::JoinHandle;

use queue::PtrQueue;
use sync::Event;

use crate::task::{Task, TaskStatus};
use crate::TaskRef;

const INBOX_CAPACITY: u32 = 256;

std::thread_local! {
    // worker index on scheduler threads, 0 everywhere else (the main thread
    // participates as worker 0 but never owns an inbox)
    static WORKER_ID: Cell<usize> = const { Cell::new(0) };
    // identity of the task currently being executed on this thread, for the
    // await re-entrancy tripwire
    static CURRENT_TASK: Cell<*const Task> = const { Cell::new(core::ptr::null()) };
}

struct Shared {
    inboxes: Box<[PtrQueue<Task>]>,
    push_event: Event,
    exec_event: Event,
    running: AtomicBool,
    threads_running: AtomicI32,
    threads_sleeping: AtomicI32,
    split: i32,
}

/// The work-distribution scheduler: one worker per hardware thread, each
/// with an MPMC inbox of task references.
///
/// Submission publishes the task to every worker; workers stripe over
/// `[0, worksize)` by fetch-adding the task's claim cursor, so the split is
/// self-balancing. Idle workers sleep on the push event; awaiters sleep on
/// the exec event. The thread that owns the `Scheduler` value (usually the
/// engine's main thread) participates only by submitting and awaiting.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

// === impl Scheduler ===

impl Scheduler {
    /// Spawns a scheduler with one worker per hardware thread (minus the
    /// calling thread, which counts as worker zero).
    #[must_use]
    pub fn new() -> Self {
        Self::with_thread_count(num_cpus::get())
    }

    /// Spawns a scheduler for an explicit total thread count (including the
    /// calling thread). Clamped to at least two.
    #[must_use]
    pub fn with_thread_count(threads: usize) -> Self {
        let threads = threads.max(2);
        let threads_i32 = i32::try_from(threads).expect("thread count");

        let shared = Arc::new(Shared {
            inboxes: (0..threads)
                .map(|_| PtrQueue::new(INBOX_CAPACITY))
                .collect(),
            push_event: Event::new(),
            exec_event: Event::new(),
            running: AtomicBool::new(true),
            threads_running: AtomicI32::new(0),
            threads_sleeping: AtomicI32::new(0),
            split: (threads_i32 * (threads_i32 / 2)).max(1),
        });

        let workers = (1..threads)
            .map(|index| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("glint-worker-{index}"))
                    .spawn(move || worker_loop(&shared, index))
                    .expect("spawning scheduler worker")
            })
            .collect();

        tracing::debug!(threads, "task scheduler up");
        Self { shared, workers }
    }

    /// Worker index of the calling thread: 1..threads on scheduler workers,
    /// 0 on every other thread (including the engine main thread).
    #[must_use]
    pub fn thread_id() -> usize {
        WORKER_ID.get()
    }

    /// Number of workers currently awake.
    pub fn num_active(&self) -> i32 {
        self.shared.threads_running.load(Ordering::Relaxed)
            - self.shared.threads_sleeping.load(Ordering::Relaxed)
    }

    /// Total thread count the scheduler was built for, including the main
    /// thread.
    pub fn thread_count(&self) -> usize {
        self.workers.len() + 1
    }

    /// Submits `task` to every worker with the given worksize.
    ///
    /// Awaits the task's previous run first, so a task object is reusable.
    /// The caller still owns its reference and must eventually
    /// [`await_task`](Self::await_task) (or poll [`TaskRef::status`]) before
    /// dropping the scheduler. A zero worksize is rejected as a no-op.
    pub fn submit(&self, task: &TaskRef, worksize: i32) {
        debug_assert!(worksize > 0, "submitted an empty task");
        if worksize <= 0 {
            return;
        }

        // a task object is reusable; wait out the previous run before
        // resetting the control block
        self.await_task(task);

        let header = task.header();
        header.worksize.store(worksize, Ordering::Relaxed);
        header
            .granularity
            .store((worksize / self.shared.split).max(1), Ordering::Relaxed);
        header.head.store(0, Ordering::Relaxed);
        header.tail.store(0, Ordering::Relaxed);
        // publish the refreshed block before any worker can claim a range
        header
            .status
            .store(TaskStatus::Exec as u32, Ordering::Release);

        tracing::trace!(task = ?task, "submit");
        for inbox in &self.shared.inboxes[1..] {
            let task_ptr = task.clone().into_raw();
            if let Err(full) = inbox.try_push(task_ptr) {
                // inboxes are sized for steady state; a full inbox means the
                // frame is hopelessly behind
                // Safety: reclaiming the reference that failed to publish
                drop(unsafe { TaskRef::from_raw(task_ptr) });
                panic!("worker inbox overflow: {full}");
            }
        }
    }

    /// Wakes every sleeping worker so freshly submitted tasks get picked up.
    pub fn schedule(&self) {
        self.shared.push_event.wake_all();
    }

    /// Per-frame hook: currently just a wake-up broadcast.
    pub fn update(&self) {
        self.schedule();
    }

    /// Blocks until `task`'s current run is complete.
    ///
    /// Completion happens-before this returns: every write the task body
    /// made is visible. Any thread may await any task, except from inside
    /// that same task's body — that would deadlock and trips an assertion.
    pub fn await_task(&self, task: &TaskRef) {
        debug_assert!(
            CURRENT_TASK.get() != task.as_ptr(),
            "awaited a task from inside its own body"
        );

        let header = task.header();
        header.awaits.fetch_add(1, Ordering::Acquire);
        while header.status() == TaskStatus::Exec {
            // a completing worker holds the task alive until `awaits` drops
            // to zero, so sleeping here is safe
            self.shared.exec_event.wait();
        }
        header.awaits.fetch_sub(1, Ordering::Release);
    }

    /// Submits, wakes the workers, and helps execute on the calling thread
    /// until the task completes.
    pub fn run(&self, task: &TaskRef, worksize: i32) {
        self.submit(task, worksize);
        self.schedule();
        // help out instead of just sleeping: claim ranges like a worker
        execute_task(&self.shared, task);
        self.await_task(task);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        while self.shared.threads_running.load(Ordering::Acquire) > 0 {
            self.shared.push_event.wake_all();
            self.shared.exec_event.wake_all();
            spin::yield_now();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        // reclaim the references of any tasks that were submitted but never
        // popped
        for inbox in &self.shared.inboxes {
            while let Some(task_ptr) = inbox.try_pop() {
                // Safety: inbox entries are leaked refs from submit
                drop(unsafe { TaskRef::from_raw(task_ptr) });
            }
        }
        tracing::debug!("task scheduler down");
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("threads", &self.thread_count())
            .field("active", &self.num_active())
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: &Shared, index: usize) {
    WORKER_ID.set(index);
    shared.threads_running.fetch_add(1, Ordering::AcqRel);

    while shared.running.load(Ordering::Relaxed) {
        if let Some(task_ptr) = shared.inboxes[index].try_pop() {
            // Safety: inbox entries are leaked refs from submit, popped once
            let task = unsafe { TaskRef::from_raw(task_ptr) };
            execute_task(shared, &task);
        } else {
            shared.threads_sleeping.fetch_add(1, Ordering::AcqRel);
            shared.push_event.wait();
            shared.threads_sleeping.fetch_sub(1, Ordering::AcqRel);
        }
    }

    shared.threads_running.fetch_sub(1, Ordering::AcqRel);
}

/// Claims and executes ranges of `task` until its cursor is exhausted.
///
/// Whichever thread completes the final range publishes `Complete` and then
/// holds the task's control block alive until every awaiter has left.
fn execute_task(shared: &Shared, task: &TaskRef) {
    let header = task.header();
    let granularity = header.granularity.load(Ordering::Relaxed);
    let worksize = header.worksize.load(Ordering::Relaxed);

    loop {
        let begin = header.head.fetch_add(granularity, Ordering::Acquire);
        let end = (begin + granularity).min(worksize);
        if begin >= end {
            break;
        }

        let prev_task = CURRENT_TASK.replace(task.as_ptr());
        task.task().work.execute(begin, end);
        CURRENT_TASK.set(prev_task);

        let count = end - begin;
        let prev = header.tail.fetch_add(count, Ordering::Release);
        debug_assert!(prev < worksize);
        if prev + count >= worksize {
            tracing::trace!(task = ?task, "complete");
            header
                .status
                .store(TaskStatus::Complete as u32, Ordering::Release);
            // spin until every awaiter has observed completion; this pins
            // the control block while await_task is still reading it
            while header.awaits.load(Ordering::Acquire) > 0 {
                shared.exec_event.wake_all();
                spin::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    fn scheduler() -> Scheduler {
        Scheduler::with_thread_count(4)
    }

    #[test]
    fn ranges_partition_worksize() {
        let sched = scheduler();
        let sum = Arc::new(AtomicI64::new(0));
        let task = {
            let sum = sum.clone();
            TaskRef::from_fn(move |begin, end| {
                sum.fetch_add(i64::from(end - begin), Ordering::Relaxed);
            })
        };

        sched.run(&task, 1_000_000);
        assert_eq!(task.status(), TaskStatus::Complete);
        assert_eq!(sum.load(Ordering::Relaxed), 1_000_000);
    }

    #[test]
    fn completion_happens_before_await_returns() {
        let sched = scheduler();
        let marker = Arc::new(AtomicI64::new(0));
        let task = {
            let marker = marker.clone();
            TaskRef::from_fn(move |begin, end| {
                for _ in begin..end {
                    marker.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        for _ in 0..10 {
            marker.store(0, Ordering::Relaxed);
            sched.submit(&task, 1000);
            sched.schedule();
            sched.await_task(&task);
            // plain load: the happens-before edge from the completing worker
            // makes the full count visible
            assert_eq!(marker.load(Ordering::Relaxed), 1000);
        }
    }

    #[test]
    fn task_objects_are_reusable() {
        let sched = scheduler();
        let sum = Arc::new(AtomicI64::new(0));
        let task = {
            let sum = sum.clone();
            TaskRef::from_fn(move |begin, end| {
                sum.fetch_add(i64::from(end - begin), Ordering::Relaxed);
            })
        };

        for round in 1..=5 {
            sched.run(&task, 100);
            assert_eq!(sum.load(Ordering::Relaxed), round * 100);
        }
    }

    #[test]
    fn await_without_submit_returns_immediately() {
        let sched = scheduler();
        let task = TaskRef::from_fn(|_, _| {});
        sched.await_task(&task);
        assert_eq!(task.status(), TaskStatus::Init);
    }

    #[test]
    fn many_tasks_in_flight() {
        let sched = scheduler();
        let sum = Arc::new(AtomicI64::new(0));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let sum = sum.clone();
                TaskRef::from_fn(move |begin, end| {
                    sum.fetch_add(i64::from(end - begin), Ordering::Relaxed);
                })
            })
            .collect();

        for task in &tasks {
            sched.submit(task, 10_000);
        }
        sched.schedule();
        for task in &tasks {
            sched.await_task(task);
        }
        assert_eq!(sum.load(Ordering::Relaxed), 8 * 10_000);
    }
}
