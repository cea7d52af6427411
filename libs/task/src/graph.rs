// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A frame graph of named task generators.
//!
//! Each [`update`] re-queries every registered [`TaskGenerator`], resolves
//! predecessor names, rejects cycles, topologically sorts, and then executes
//! the whole plan across the graph's own worker pool plus the calling
//! thread. Execution uses the same striped claim-cursor protocol as the
//! scheduler; the frame ends with a full-pool barrier rendezvous.
//!
//! [`update`]: TaskGraph::update

use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use sync::{Barrier, Event, Mutex};

use crate::TaskStatus;

/// A unit of frame work: executed over striped `[begin, end)` ranges with
/// its predecessors' nodes available for reading results.
pub trait TaskNode: Send + Sync + 'static {
    fn execute(&self, begin: i32, end: i32, preds: &[Arc<dyn TaskNode>]);

    /// Downcasting hook so dependents can read a predecessor's output.
    fn as_any(&self) -> &dyn Any;
}

/// Produces one graph node per frame.
pub trait TaskGenerator: Send + 'static {
    /// Unique name this generator is addressed by.
    fn name(&self) -> &'static str;

    /// Emits this frame's node, its predecessor names, and its worksize.
    /// `None` skips the generator for this frame.
    fn generate(&mut self, preds: &mut Vec<&'static str>) -> Option<(Arc<dyn TaskNode>, i32)>;
}

struct PlanEntry {
    node: Option<Arc<dyn TaskNode>>,
    preds: Vec<usize>,
    pred_nodes: Vec<Arc<dyn TaskNode>>,
    worksize: i32,
    granularity: i32,
    status: AtomicU32,
    head: AtomicI32,
    tail: AtomicI32,
    predtally: AtomicI32,
    dep_event: Event,
}

impl PlanEntry {
    fn status(&self) -> TaskStatus {
        match self.status.load(Ordering::Acquire) {
            0 => TaskStatus::Init,
            1 => TaskStatus::Exec,
            _ => TaskStatus::Complete,
        }
    }
}

struct FramePlan {
    entries: Vec<PlanEntry>,
    // entry indices in topological order
    work: Vec<usize>,
}

struct GraphShared {
    plan: Mutex<Option<Arc<FramePlan>>>,
    begin: Event,
    barrier: Barrier,
    running: AtomicBool,
    threads_running: AtomicI32,
}

/// Topologically-ordered frame graph with its own worker pool.
pub struct TaskGraph {
    generators: Vec<Box<dyn TaskGenerator>>,
    lookup: HashMap<&'static str, usize>,
    shared: Arc<GraphShared>,
    threads: Vec<JoinHandle<()>>,
    split: i32,
}

// === impl TaskGraph ===

impl TaskGraph {
    /// Builds a graph driving `threads` total threads (including the one
    /// calling [`update`](Self::update)). Clamped to at least two.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(2);
        let threads_i32 = i32::try_from(threads).expect("thread count");

        let shared = Arc::new(GraphShared {
            plan: Mutex::new(None),
            begin: Event::new(),
            barrier: Barrier::new(threads_i32),
            running: AtomicBool::new(true),
            threads_running: AtomicI32::new(0),
        });

        let workers = (1..threads)
            .map(|index| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("glint-graph-{index}"))
                    .spawn(move || graph_worker(&shared))
                    .expect("spawning graph worker")
            })
            .collect();

        Self {
            generators: Vec::new(),
            lookup: HashMap::new(),
            shared,
            threads: workers,
            split: (threads_i32 * threads_i32).max(1),
        }
    }

    /// Registers a generator under its name. Returns `false` if the name is
    /// already taken.
    pub fn register(&mut self, generator: Box<dyn TaskGenerator>) -> bool {
        let name = generator.name();
        if self.lookup.contains_key(name) {
            return false;
        }
        self.lookup.insert(name, self.generators.len());
        self.generators.push(generator);
        true
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    /// Runs one frame: regenerate, sort, execute across the pool, barrier.
    ///
    /// # Panics
    ///
    /// Panics when a predecessor name is unknown or the dependencies form a
    /// cycle.
    pub fn update(&mut self) {
        let plan = self.build_plan();
        if plan.work.is_empty() {
            return;
        }
        let plan = Arc::new(plan);
        *self.shared.plan.lock() = Some(plan.clone());

        self.shared.begin.wake_all();
        execute_graph(&self.shared, &plan);
    }

    fn build_plan(&mut self) -> FramePlan {
        let mut entries = Vec::with_capacity(self.generators.len());
        let mut pred_names = Vec::new();

        for generator in &mut self.generators {
            pred_names.clear();
            let generated = generator.generate(&mut pred_names);
            let (node, worksize) = match generated {
                Some((node, worksize)) => (Some(node), worksize),
                None => (None, 0),
            };
            debug_assert!(worksize >= 0);

            let preds = pred_names
                .iter()
                .map(|name| {
                    *self
                        .lookup
                        .get(name)
                        .unwrap_or_else(|| panic!("unknown graph predecessor {name:?}"))
                })
                .collect::<Vec<_>>();

            entries.push(PlanEntry {
                node,
                preds,
                pred_nodes: Vec::new(),
                worksize,
                granularity: (worksize / self.split).max(1),
                // nodes with no work to stripe are born complete, so
                // dependents never stall on them
                status: AtomicU32::new(if worksize > 0 {
                    TaskStatus::Exec as u32
                } else {
                    TaskStatus::Complete as u32
                }),
                head: AtomicI32::new(0),
                tail: AtomicI32::new(0),
                predtally: AtomicI32::new(0),
                dep_event: Event::new(),
            });
        }

        // resolve predecessor node handles for the execute callbacks
        for i in 0..entries.len() {
            let pred_nodes = entries[i]
                .preds
                .iter()
                .filter_map(|&pred| entries[pred].node.clone())
                .collect::<Vec<_>>();
            entries[i].pred_nodes = pred_nodes;
            let tally = i32::try_from(entries[i].preds.len()).expect("pred count");
            entries[i].predtally.store(tally, Ordering::Relaxed);
        }

        // depth-first topological sort with a tri-state marker; re-entering
        // an in-progress node is a cycle
        let mut work = Vec::with_capacity(entries.len());
        let mut visited = vec![0_u8; entries.len()];
        for index in 0..entries.len() {
            if entries[index].node.is_some() && visited[index] == 0 {
                sort_visit(&entries, &mut visited, &mut work, index);
            }
        }

        FramePlan { entries, work }
    }
}

fn sort_visit(entries: &[PlanEntry], visited: &mut [u8], work: &mut Vec<usize>, index: usize) {
    assert!(visited[index] != 1, "task graph cycle at entry {index}");
    if visited[index] != 0 {
        return;
    }
    visited[index] = 1;
    for &pred in &entries[index].preds {
        sort_visit(entries, visited, work, pred);
    }
    work.push(index);
    visited[index] = 2;
}

impl Drop for TaskGraph {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        while self.shared.threads_running.load(Ordering::Acquire) > 0 {
            self.shared.begin.wake_all();
            spin::yield_now();
        }
        for worker in self.threads.drain(..) {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGraph")
            .field("generators", &self.generators.len())
            .field("threads", &(self.threads.len() + 1))
            .finish_non_exhaustive()
    }
}

fn graph_worker(shared: &GraphShared) {
    shared.threads_running.fetch_add(1, Ordering::AcqRel);

    while shared.running.load(Ordering::Acquire) {
        shared.begin.wait();
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        let plan = shared.plan.lock().clone();
        if let Some(plan) = plan {
            execute_graph(shared, &plan);
        }
    }

    shared.threads_running.fetch_sub(1, Ordering::AcqRel);
}

fn execute_graph(shared: &GraphShared, plan: &FramePlan) {
    if !shared.running.load(Ordering::Acquire) {
        return;
    }
    for &index in &plan.work {
        await_preds(plan, index);
        execute_entry(&plan.entries[index]);
    }
    shared.barrier.wait();
}

/// Blocks until every predecessor of `entry` is complete.
///
/// The fast path observes completion directly and zeroes the tally; the
/// slow path sleeps on the entry's dep event, woken by whichever thread
/// zeroes it.
fn await_preds(plan: &FramePlan, index: usize) {
    let entry = &plan.entries[index];
    if entry.preds.is_empty() {
        return;
    }

    let complete = entry
        .preds
        .iter()
        .filter(|&&pred| plan.entries[pred].status() == TaskStatus::Complete)
        .count();
    if complete == entry.preds.len() {
        entry.predtally.store(0, Ordering::Release);
    }

    if entry.predtally.load(Ordering::Acquire) == 0 {
        entry.dep_event.wake_all();
    } else {
        while entry.predtally.load(Ordering::Acquire) != 0 {
            entry.dep_event.wait();
        }
    }
}

fn execute_entry(entry: &PlanEntry) {
    let Some(node) = &entry.node else { return };
    let worksize = entry.worksize;
    let granularity = entry.granularity;

    loop {
        let begin = entry.head.fetch_add(granularity, Ordering::Acquire);
        let end = (begin + granularity).min(worksize);
        if begin >= end {
            break;
        }

        node.execute(begin, end, &entry.pred_nodes);

        let count = end - begin;
        let prev = entry.tail.fetch_add(count, Ordering::Release);
        debug_assert!(prev < worksize);
        if prev + count >= worksize {
            entry
                .status
                .store(TaskStatus::Complete as u32, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingNode {
        hits: AtomicUsize,
        observed_preds: AtomicUsize,
    }

    impl TaskNode for CountingNode {
        fn execute(&self, begin: i32, end: i32, preds: &[Arc<dyn TaskNode>]) {
            for pred in preds {
                let pred = pred
                    .as_any()
                    .downcast_ref::<CountingNode>()
                    .expect("all test nodes are CountingNode");
                // every predecessor must have fully executed already
                assert!(pred.hits.load(Ordering::SeqCst) >= 1);
            }
            self.observed_preds.store(preds.len(), Ordering::SeqCst);
            self.hits
                .fetch_add(usize::try_from(end - begin).unwrap(), Ordering::SeqCst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct CountingGenerator {
        name: &'static str,
        preds: Vec<&'static str>,
        worksize: i32,
        node: Arc<CountingNode>,
    }

    impl CountingGenerator {
        fn boxed(name: &'static str, preds: &[&'static str], worksize: i32) -> Box<Self> {
            Box::new(Self {
                name,
                preds: preds.to_vec(),
                worksize,
                node: Arc::new(CountingNode {
                    hits: AtomicUsize::new(0),
                    observed_preds: AtomicUsize::new(0),
                }),
            })
        }
    }

    impl TaskGenerator for CountingGenerator {
        fn name(&self) -> &'static str {
            self.name
        }

        fn generate(&mut self, preds: &mut Vec<&'static str>) -> Option<(Arc<dyn TaskNode>, i32)> {
            preds.extend_from_slice(&self.preds);
            self.node.hits.store(0, Ordering::SeqCst);
            Some((self.node.clone(), self.worksize))
        }
    }

    #[test]
    fn registration_rejects_duplicates() {
        let mut graph = TaskGraph::new(2);
        assert!(graph.register(CountingGenerator::boxed("a", &[], 8)));
        assert!(!graph.register(CountingGenerator::boxed("a", &[], 8)));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn chain_runs_in_dependency_order() {
        let mut graph = TaskGraph::new(4);
        let a = CountingGenerator::boxed("a", &[], 64);
        let b = CountingGenerator::boxed("b", &["a"], 64);
        let c = CountingGenerator::boxed("c", &["b"], 64);
        let (na, nb, nc) = (a.node.clone(), b.node.clone(), c.node.clone());

        graph.register(a);
        graph.register(b);
        graph.register(c);

        for _ in 0..3 {
            graph.update();
            assert_eq!(na.hits.load(Ordering::SeqCst), 64);
            assert_eq!(nb.hits.load(Ordering::SeqCst), 64);
            assert_eq!(nc.hits.load(Ordering::SeqCst), 64);
        }
        assert_eq!(nc.observed_preds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn diamond_converges() {
        let mut graph = TaskGraph::new(4);
        let root = CountingGenerator::boxed("root", &[], 128);
        let left = CountingGenerator::boxed("left", &["root"], 128);
        let right = CountingGenerator::boxed("right", &["root"], 128);
        let join = CountingGenerator::boxed("join", &["left", "right"], 128);
        let node = join.node.clone();

        graph.register(root);
        graph.register(left);
        graph.register(right);
        graph.register(join);

        graph.update();
        assert_eq!(node.hits.load(Ordering::SeqCst), 128);
        assert_eq!(node.observed_preds.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic(expected = "cycle")]
    fn cycle_is_detected() {
        let mut graph = TaskGraph::new(2);
        graph.register(CountingGenerator::boxed("x", &["y"], 8));
        graph.register(CountingGenerator::boxed("y", &["x"], 8));
        graph.update();
    }
}
