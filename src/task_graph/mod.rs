//! Task graph (C4): a fixed set of typed task queues, each with an
//! optional per-flush static-data loader, drained by a bounded worker pool
//! that always flushes the task with the largest backlog first.
//!
//! This is the mechanism that turns "batch rays per subscene" into a
//! memory-bounded execution model (SPEC_FULL.md §4.4): choosing the
//! biggest queue ensures a subscene's residency + BVH-load cost is
//! amortized over the maximum number of rays before the next one is paid.

mod queue;

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::stats::Stats;
use queue::TaskQueue;

/// Max items drained from a single task's queue per flush (spec.md §4.4).
const FLUSH_CHUNK_SIZE: usize = 32;

/// A type-erased task: what the scheduler actually holds one of per
/// registered task. The `T`-typed surface (`Handle<T>`, `enqueue`) is
/// recovered through downcasting on the owning `TaskGraph`.
trait ErasedTask: Send + Sync {
    fn approx_queue_size(&self) -> usize;
    fn flush(&self, graph: &TaskGraph);
    fn name(&self) -> &str;
    /// Exposes the concrete `TaskQueue<T>` for `enqueue`/`enqueue_many`,
    /// which know `T` but not this task's (possibly distinct) static-data
    /// type `S`.
    fn queue_any(&self) -> &dyn Any;
}

struct StaticLoader<S> {
    load: Box<dyn Fn(&mut S) + Send + Sync>,
}

struct Task<T, S> {
    name: String,
    queue: TaskQueue<T>,
    kernel: Box<dyn Fn(&[T], Option<&S>, &TaskGraph) + Send + Sync>,
    static_loader: Option<StaticLoader<S>>,
}

impl<T: Send + Sync + 'static, S: Default + Send + Sync + 'static> ErasedTask for Task<T, S> {
    fn approx_queue_size(&self) -> usize {
        self.queue.approx_len()
    }

    fn flush(&self, graph: &TaskGraph) {
        let items = self.queue.drain_up_to(FLUSH_CHUNK_SIZE);
        if items.is_empty() {
            return;
        }

        // "One static-data load per flush": allocate and populate once,
        // share (by reference) across every chunk invocation, then drop.
        let mut static_data = self.static_loader.as_ref().map(|loader| {
            let mut value = S::default();
            (loader.load)(&mut value);
            value
        });

        graph.stats.record_task_flush(items.len());
        tracing::debug!(task = %self.name, count = items.len(), "flushing task");

        // Chunks within a flush may run in parallel; the kernel must be
        // safe to invoke concurrently with itself.
        const SUBCHUNK: usize = 8;
        items.par_chunks(SUBCHUNK).for_each(|chunk| {
            (self.kernel)(chunk, static_data.as_ref(), graph);
        });

        static_data.take();
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn queue_any(&self) -> &dyn Any {
        &self.queue
    }
}

/// A typed reference to a registered task, used to `enqueue` onto it.
pub struct Handle<T> {
    index: usize,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}

/// The task graph itself: a fixed set of typed queues plus the scheduler
/// loop that drains them.
pub struct TaskGraph {
    tasks: Vec<Box<dyn ErasedTask>>,
    stats: Arc<Stats>,
    worker_threads: usize,
}

impl TaskGraph {
    pub fn new(worker_threads: usize, stats: Arc<Stats>) -> Self {
        TaskGraph {
            tasks: Vec::new(),
            stats,
            worker_threads,
        }
    }

    /// Registers a task with no static data. The kernel receives the task
    /// graph itself so it can enqueue follow-up work onto other tasks
    /// (resuming a paused traversal, delivering to an integrator task, ...).
    pub fn add_task<T, F>(&mut self, name: impl Into<String>, kernel: F) -> Handle<T>
    where
        T: Send + Sync + 'static,
        F: Fn(&[T], Option<&()>, &TaskGraph) + Send + Sync + 'static,
    {
        let index = self.tasks.len();
        self.tasks.push(Box::new(Task::<T, ()> {
            name: name.into(),
            queue: TaskQueue::new(),
            kernel: Box::new(kernel),
            static_loader: None,
        }));
        Handle {
            index,
            _marker: PhantomData,
        }
    }

    /// Registers a task whose static data is lazily (re)initialized once
    /// at the start of every flush of this task, via `static_loader`.
    pub fn add_task_with_static<T, S, L, F>(
        &mut self,
        name: impl Into<String>,
        static_loader: L,
        kernel: F,
    ) -> Handle<T>
    where
        T: Send + Sync + 'static,
        S: Default + Send + Sync + 'static,
        L: Fn(&mut S) + Send + Sync + 'static,
        F: Fn(&[T], Option<&S>, &TaskGraph) + Send + Sync + 'static,
    {
        let index = self.tasks.len();
        self.tasks.push(Box::new(Task::<T, S> {
            name: name.into(),
            queue: TaskQueue::new(),
            kernel: Box::new(kernel),
            static_loader: Some(StaticLoader {
                load: Box::new(static_loader),
            }),
        }));
        Handle {
            index,
            _marker: PhantomData,
        }
    }

    fn queue<T: Send + Sync + 'static>(&self, handle: Handle<T>) -> &TaskQueue<T> {
        self.tasks[handle.index]
            .queue_any()
            .downcast_ref::<TaskQueue<T>>()
            .expect("Handle<T> must address the task type it was issued for")
    }

    pub fn enqueue<T: Send + Sync + 'static>(&self, handle: Handle<T>, item: T) {
        self.queue(handle).push(item);
    }

    pub fn enqueue_many<T: Send + Sync + 'static>(
        &self,
        handle: Handle<T>,
        items: impl IntoIterator<Item = T>,
    ) {
        let queue = self.queue(handle);
        for item in items {
            queue.push(item);
        }
    }

    fn approx_queue_sizes(&self) -> Vec<usize> {
        self.tasks.iter().map(|t| t.approx_queue_size()).collect()
    }

    /// Drives execution until every queue is empty. Repeatedly: pick the
    /// task with the largest backlog, flush ≤ `FLUSH_CHUNK_SIZE` items from
    /// it; enqueues performed by a kernel target other tasks and are picked
    /// up on a later iteration. No cancellation, no timeouts: a fatal error
    /// inside a kernel aborts the process (see `crate::error::fatal`).
    pub fn run(&self) {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.worker_threads)
            .build()
            .unwrap_or_else(|e| crate::fatal_setup!("failed to build task graph worker pool: {e}"));

        pool.install(|| loop {
            let sizes = self.approx_queue_sizes();
            let Some((biggest_idx, &biggest_size)) = sizes
                .iter()
                .enumerate()
                .max_by_key(|(_, size)| **size)
            else {
                break;
            };
            if biggest_size == 0 {
                break;
            }
            self.tasks[biggest_idx].flush(self);
        });
    }
}

/// Per-worker thread-local staging used by high-frequency enqueue sites to
/// amortize contention on a task's queue; flushed explicitly by the caller
/// (typically once per traversal batch) rather than on every push.
pub struct StagingBuffer<T> {
    items: Vec<T>,
    flush_threshold: usize,
    flushed_count: AtomicUsize,
}

impl<T> StagingBuffer<T> {
    pub fn new(flush_threshold: usize) -> Self {
        StagingBuffer {
            items: Vec::with_capacity(flush_threshold),
            flush_threshold,
            flushed_count: AtomicUsize::new(0),
        }
    }

    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.items.push(item);
        if self.items.len() >= self.flush_threshold {
            Some(self.take())
        } else {
            None
        }
    }

    pub fn take(&mut self) -> Vec<T> {
        self.flushed_count
            .fetch_add(self.items.len(), Ordering::Relaxed);
        std::mem::take(&mut self.items)
    }
}
