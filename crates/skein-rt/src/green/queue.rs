// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Run queues: one bounded local queue per carrier plus a global injector.
//!
//! Carriers push wakeups onto their own queue; everything else (spawns from
//! plain threads, overflow) lands in the injector. Idle carriers steal half
//! of a random peer's queue.
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::task::RawTask;

/// Per-carrier local queue.
///
/// Owner pops from the front, stealers take from the back. Both paths share
/// one mutex; contention is limited to steal attempts by idle carriers.
pub(crate) struct LocalQueue {
    deque: Mutex<VecDeque<Arc<RawTask>>>,
    capacity: usize,
}

impl LocalQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            deque: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Push a task. Hands it back if the queue is full.
    pub fn push(&self, task: Arc<RawTask>) -> Result<(), Arc<RawTask>> {
        let mut q = self.deque.lock();
        if q.len() >= self.capacity {
            return Err(task);
        }
        q.push_back(task);
        Ok(())
    }

    pub fn pop(&self) -> Option<Arc<RawTask>> {
        self.deque.lock().pop_front()
    }

    /// Steal half the queue from the back, at least one task if any.
    pub fn steal_batch(&self) -> Vec<Arc<RawTask>> {
        let mut q = self.deque.lock();
        let count = (q.len() / 2).max(q.len().min(1));
        let mut stolen = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(task) = q.pop_back() {
                stolen.push(task);
            }
        }
        // Keep the victim's order among the stolen tasks.
        stolen.reverse();
        stolen
    }

    pub fn len(&self) -> usize {
        self.deque.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.deque.lock().is_empty()
    }
}

/// Global injection queue.
pub(crate) struct InjectorQueue {
    queue: Mutex<VecDeque<Arc<RawTask>>>,
}

impl InjectorQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, task: Arc<RawTask>) {
        self.queue.lock().push_back(task);
    }

    pub fn pop(&self) -> Option<Arc<RawTask>> {
        self.queue.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::green::task::{Outcome, TaskId};
    use std::panic::Location;

    fn dummy_task(id: u64) -> Arc<RawTask> {
        RawTask::new(
            TaskId(id),
            None,
            None,
            Box::pin(async { Outcome::Completed }),
            Location::caller(),
        )
    }

    #[test]
    fn local_queue_push_pop() {
        let q = LocalQueue::new(8);
        q.push(dummy_task(1)).unwrap();
        assert!(!q.is_empty());
        assert_eq!(q.pop().unwrap().id(), TaskId(1));
        assert!(q.is_empty());
    }

    #[test]
    fn local_queue_overflow() {
        let q = LocalQueue::new(4);
        for i in 0..4 {
            q.push(dummy_task(i)).unwrap();
        }
        let rejected = q.push(dummy_task(99)).unwrap_err();
        assert_eq!(rejected.id(), TaskId(99));
    }

    #[test]
    fn local_queue_steal_batch() {
        let q = LocalQueue::new(64);
        for i in 0..10 {
            q.push(dummy_task(i)).unwrap();
        }
        let stolen = q.steal_batch();
        assert_eq!(stolen.len(), 5);
        assert_eq!(q.len(), 5);
        let ids: Vec<u64> = stolen.iter().map(|t| t.id().0).collect();
        assert_eq!(ids, vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn local_queue_steal_at_least_one() {
        let q = LocalQueue::new(64);
        q.push(dummy_task(1)).unwrap();
        assert_eq!(q.steal_batch().len(), 1);
        assert!(q.is_empty());
        assert!(q.steal_batch().is_empty());
    }

    #[test]
    fn injector_is_fifo() {
        let q = InjectorQueue::new();
        q.push(dummy_task(1));
        q.push(dummy_task(2));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().id(), TaskId(1));
        assert_eq!(q.pop().unwrap().id(), TaskId(2));
        assert!(q.is_empty());
    }
}
