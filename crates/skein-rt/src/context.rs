// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-thread runtime context.
//!
//! Carrier threads record which runtime they belong to; while a task is
//! being polled the carrier also records the task. Everything that needs to
//! know "who is calling" (scope ownership, the gate, cancellation checks)
//! reads it from here instead of from global state.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::green::scheduler::Shared;
use crate::green::task::{RawTask, TaskId};
use crate::runtime::Handle;

/// Identity of whoever opened a scope or is calling into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// A lightweight task.
    Task(TaskId),
    /// Plain OS thread outside any carrier (e.g. `main`).
    Thread(ThreadId),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Task(id) => write!(f, "{}", id),
            Owner::Thread(id) => write!(f, "thread {:?}", id),
        }
    }
}

struct CarrierSlot {
    shared: Arc<Shared>,
    id: usize,
}

thread_local! {
    static CARRIER: RefCell<Option<CarrierSlot>> = const { RefCell::new(None) };
    static TASK: RefCell<Option<Arc<RawTask>>> = const { RefCell::new(None) };
}

/// Mark the current OS thread as carrier `id` of `shared`.
pub(crate) fn enter_carrier(shared: Arc<Shared>, id: usize) {
    CARRIER.with(|cell| *cell.borrow_mut() = Some(CarrierSlot { shared, id }));
}

pub(crate) fn leave_carrier() {
    CARRIER.with(|cell| cell.borrow_mut().take());
}

/// Run `f` with `task` installed as the current task.
pub(crate) fn with_task<R>(task: &Arc<RawTask>, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Arc<RawTask>>);
    impl Drop for Restore {
        fn drop(&mut self) {
            let prev = self.0.take();
            TASK.with(|cell| *cell.borrow_mut() = prev);
        }
    }

    let prev = TASK.with(|cell| cell.borrow_mut().replace(task.clone()));
    let _restore = Restore(prev);
    f()
}

pub(crate) fn current_shared() -> Option<Arc<Shared>> {
    CARRIER.with(|cell| cell.borrow().as_ref().map(|slot| slot.shared.clone()))
}

pub(crate) fn current_task() -> Option<Arc<RawTask>> {
    TASK.with(|cell| cell.borrow().clone())
}

/// Carrier index of the current thread, if it is a carrier.
pub fn current_carrier() -> Option<usize> {
    CARRIER.with(|cell| cell.borrow().as_ref().map(|slot| slot.id))
}

/// Is the current thread a carrier of exactly this runtime?
pub(crate) fn is_carrier_of(shared: &Arc<Shared>) -> Option<usize> {
    CARRIER.with(|cell| {
        cell.borrow()
            .as_ref()
            .filter(|slot| Arc::ptr_eq(&slot.shared, shared))
            .map(|slot| slot.id)
    })
}

pub fn current_task_id() -> Option<TaskId> {
    TASK.with(|cell| cell.borrow().as_ref().map(|t| t.id()))
}

/// Handle to the runtime driving the current thread, if any.
pub fn current_handle() -> Option<Handle> {
    current_shared().map(Handle::from_shared)
}

/// The caller's identity for ownership checks.
pub fn owner() -> Owner {
    match current_task_id() {
        Some(id) => Owner::Task(id),
        None => Owner::Thread(thread::current().id()),
    }
}

/// Has cancellation been requested for the current task?
///
/// Always false outside a task.
pub fn cancelled() -> bool {
    TASK.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|t| t.header.cancel_token.is_cancelled())
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_thread_has_no_context() {
        assert!(current_carrier().is_none());
        assert!(current_task_id().is_none());
        assert!(!cancelled());
        assert_eq!(owner(), Owner::Thread(thread::current().id()));
    }

    #[test]
    fn owner_display() {
        assert_eq!(Owner::Task(TaskId(12)).to_string(), "task-12");
        assert!(Owner::Thread(thread::current().id())
            .to_string()
            .starts_with("thread "));
    }
}
