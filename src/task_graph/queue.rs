//! Lock-free MPMC queue backing a single task, plus an O(1) approximate
//! length counter (`crossbeam::SegQueue` itself is unbounded but doesn't
//! track its own length cheaply).

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

pub struct TaskQueue<T> {
    queue: SegQueue<T>,
    len: AtomicUsize,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        TaskQueue {
            queue: SegQueue::new(),
            len: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, item: T) {
        self.queue.push(item);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    pub fn approx_len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Pops at most `n` items. Non-blocking; returns fewer than `n` if the
    /// queue runs dry concurrently with the drain.
    pub fn drain_up_to(&self, n: usize) -> Vec<T> {
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            match self.queue.pop() {
                Some(item) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    items.push(item);
                }
                None => break,
            }
        }
        items
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_len_tracks_push_and_drain() {
        let queue: TaskQueue<u32> = TaskQueue::new();
        for i in 0..10 {
            queue.push(i);
        }
        assert_eq!(queue.approx_len(), 10);
        let drained = queue.drain_up_to(4);
        assert_eq!(drained.len(), 4);
        assert_eq!(queue.approx_len(), 6);
    }
}
