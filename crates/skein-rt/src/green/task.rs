// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Lightweight task representation.
//!
//! Stackless tasks: a boxed future plus a header the scheduler, handles,
//! scopes and the gate all share. The scheduler owns the polling loop.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe, Location};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::scheduler::Shared;
use super::waiters::{wake_all, Waiters};
use crate::cancel::CancelToken;
use crate::error::Error;
use crate::gate::Resource;
use crate::scope::ScopeInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// Queued, waiting for a carrier.
    Runnable = 0,
    /// Being polled by a carrier.
    Running = 1,
    /// Suspended at a cooperative wait; holds no carrier.
    Parked = 2,
    /// Blocked inside a pinning region; holds its carrier.
    Pinned = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Runnable,
            1 => Self::Running,
            2 => Self::Parked,
            3 => Self::Pinned,
            4 => Self::Completed,
            5 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// How a task ended. The typed value, if any, lives in the handle's slot.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Completed,
    Failed(Error),
    Cancelled,
}

impl Outcome {
    pub fn state(&self) -> TaskState {
        match self {
            Outcome::Completed => TaskState::Completed,
            Outcome::Failed(_) => TaskState::Failed,
            Outcome::Cancelled => TaskState::Cancelled,
        }
    }
}

/// Type-erased future for the scheduler. The typed result is written to a
/// `ResultSlot` by the wrapper the spawner builds.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

pub(crate) struct JoinState {
    pub done: bool,
    pub waiters: Waiters,
}

/// Header shared between scheduler, handles, scopes and the gate.
pub(crate) struct TaskHeader {
    pub id: TaskId,
    /// Task that forked this one, if it was forked from inside a task.
    pub parent: Option<TaskId>,
    /// Owning scope. Held strongly so the scope outlives the task.
    pub scope: Option<Arc<ScopeInner>>,
    pub state: AtomicU8,
    /// Set by wakers that fire while the task is not parked.
    pub notified: AtomicBool,
    pub cancel_token: CancelToken,
    pub outcome: Mutex<Option<Outcome>>,
    pub join: Mutex<JoinState>,
    /// Signal for OS threads blocking on completion.
    pub join_cvar: Condvar,
    /// Resource of the wait the task is currently in, for snapshots.
    pub blocked_on: Mutex<Option<Resource>>,
    /// Runtime to re-enqueue into. Set once when the task is submitted.
    pub scheduler: OnceLock<Weak<Shared>>,
    pub spawned_at: &'static Location<'static>,
}

/// The task object owned by the scheduler.
pub(crate) struct RawTask {
    pub header: TaskHeader,
    future: Mutex<Option<BoxFuture>>,
}

impl fmt::Debug for RawTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTask")
            .field("id", &self.header.id)
            .field("state", &self.state())
            .field("spawned_at", &self.header.spawned_at)
            .finish()
    }
}

impl RawTask {
    pub fn new(
        id: TaskId,
        parent: Option<TaskId>,
        scope: Option<Arc<ScopeInner>>,
        future: BoxFuture,
        spawned_at: &'static Location<'static>,
    ) -> Arc<Self> {
        Arc::new(Self {
            header: TaskHeader {
                id,
                parent,
                scope,
                state: AtomicU8::new(TaskState::Runnable as u8),
                notified: AtomicBool::new(false),
                cancel_token: CancelToken::new(),
                outcome: Mutex::new(None),
                join: Mutex::new(JoinState {
                    done: false,
                    waiters: Waiters::new(),
                }),
                join_cvar: Condvar::new(),
                blocked_on: Mutex::new(None),
                scheduler: OnceLock::new(),
                spawned_at,
            },
            future: Mutex::new(Some(future)),
        })
    }

    pub fn id(&self) -> TaskId {
        self.header.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.header.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TaskState) {
        self.header.state.store(state as u8, Ordering::Release);
    }

    pub fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.header
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn blocked_on(&self) -> Option<Resource> {
        *self.header.blocked_on.lock()
    }

    pub fn set_blocked_on(&self, resource: Option<Resource>) {
        *self.header.blocked_on.lock() = resource;
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.header.outcome.lock().clone()
    }

    /// Poll the future once. `Some` means the task finished.
    ///
    /// Panics are caught here so they never unwind into the carrier.
    pub fn poll(self: &Arc<Self>) -> Option<Outcome> {
        let waker = task_waker(self.clone());
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock();
        let fut = slot.as_mut()?;

        match panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(outcome)) => Some(outcome),
            Ok(Poll::Pending) => None,
            Err(payload) => Some(Outcome::Failed(Error::Failed(panic_message(&*payload)))),
        }
    }

    /// Record the outcome, drop the future, and release every joiner.
    pub fn finish(&self, outcome: Outcome) {
        self.set_state(outcome.state());
        *self.header.outcome.lock() = Some(outcome);
        self.set_blocked_on(None);

        // Dropping the future may release permits and wake other tasks.
        let fut = self.future.lock().take();
        drop(fut);

        let wakers = {
            let mut join = self.header.join.lock();
            join.done = true;
            join.waiters.take_all()
        };
        self.header.join_cvar.notify_all();
        wake_all(wakers);
    }

    /// Request cooperative cancellation and wake the task so it notices.
    pub fn cancel(self: &Arc<Self>) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        let first = self.header.cancel_token.cancel();
        if first {
            self.wake();
        }
        first
    }

    /// Make the task runnable again if it is parked.
    pub fn wake(self: &Arc<Self>) {
        self.header.notified.store(true, Ordering::SeqCst);
        if self.transition(TaskState::Parked, TaskState::Runnable) {
            self.schedule();
        }
    }

    pub fn schedule(self: &Arc<Self>) {
        if let Some(shared) = self.header.scheduler.get().and_then(Weak::upgrade) {
            shared.enqueue(self.clone());
        }
    }
}

/// Waker that re-enqueues a task with its scheduler.
struct TaskWaker {
    task: Arc<RawTask>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.task.wake();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.task.wake();
    }
}

fn task_waker(task: Arc<RawTask>) -> Waker {
    Waker::from(Arc::new(TaskWaker { task }))
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}

/// Typed result slot shared between the spawned future and the handle.
pub(crate) struct ResultSlot<T> {
    inner: Mutex<Option<T>>,
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn set(&self, value: T) {
        *self.inner.lock() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.inner.lock().take()
    }
}
