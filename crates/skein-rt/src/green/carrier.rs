// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Carrier bookkeeping: which task an OS worker is running and whether it
//! is pinned.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::task::TaskId;

pub(crate) struct Carrier {
    pub id: usize,
    pub name: String,
    /// Task id + 1 of the bound task, 0 when idle.
    current: AtomicU64,
    pinned: AtomicBool,
    polls: AtomicU64,
}

impl Carrier {
    pub fn new(id: usize, prefix: &str) -> Self {
        Self {
            id,
            name: format!("{}-{}", prefix, id),
            current: AtomicU64::new(0),
            pinned: AtomicBool::new(false),
            polls: AtomicU64::new(0),
        }
    }

    pub fn bind(&self, task: TaskId) {
        self.current.store(task.0 + 1, Ordering::Release);
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unbind(&self) {
        self.current.store(0, Ordering::Release);
    }

    pub fn current(&self) -> Option<TaskId> {
        match self.current.load(Ordering::Acquire) {
            0 => None,
            n => Some(TaskId(n - 1)),
        }
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Release);
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }
}
