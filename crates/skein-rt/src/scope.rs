// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Structured task scopes.
//!
//! A scope bounds the lifetime of the tasks forked into it: the owner
//! joins, then closes, and a scope cannot close while it has live tasks,
//! unjoined forks or open child scopes. Scopes nest into a forest; the
//! parent is fixed when the scope opens.
//!
//! Forking is allowed from the owner and from any task running inside the
//! scope or one of its descendants, so a task can fork a sibling into an
//! ancestor scope. Joining and closing are owner-only.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::panic::Location;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::observe_interrupt;
use crate::context::{self, Owner};
use crate::error::{Error, Result, Violation};
use crate::gate::{self, Resource};
use crate::green::handle::{build_task, TaskHandle};
use crate::green::scheduler::Shared;
use crate::green::task::{Outcome, RawTask, TaskId};
use crate::green::waiters::{wake_all, Waiters};
use crate::time::Delay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ScopeId(pub u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

/// What a scope does when one of its tasks fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Policy {
    /// Cancel the siblings; join reports the first failure.
    ShutdownOnFailure,
    /// Let every task finish; join reports all failures.
    CollectAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Open,
    Joining,
    Closed,
}

/// Outcome counts of a scope's tasks, as seen by `join`.
#[derive(Debug, Clone, Default)]
pub struct JoinReport {
    pub completed: usize,
    pub cancelled: usize,
    pub failures: Vec<Error>,
}

impl JoinReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Err(Aggregate)` if any task failed.
    pub fn into_result(self) -> Result<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(Error::Aggregate(self.failures))
        }
    }
}

struct ScopeState {
    phase: Phase,
    live: HashMap<TaskId, Weak<RawTask>>,
    /// Forks since the last completed join.
    unjoined: usize,
    /// Open child scopes. Children remove themselves when they close.
    children: BTreeMap<ScopeId, Weak<ScopeInner>>,
    shutdown: bool,
    first_failure: Option<Error>,
    failures: Vec<Error>,
    completed: usize,
    cancelled: usize,
    waiters: Waiters,
}

pub(crate) struct ScopeInner {
    pub id: ScopeId,
    pub name: String,
    pub policy: Policy,
    pub owner: Owner,
    pub parent: Option<Arc<ScopeInner>>,
    shared: Weak<Shared>,
    state: Mutex<ScopeState>,
    cvar: Condvar,
}

impl ScopeInner {
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn live(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn open_children(&self) -> usize {
        self.state.lock().children.len()
    }

    /// Is `other` this scope or nested somewhere below it?
    fn encloses(&self, other: &ScopeInner) -> bool {
        let mut cursor = Some(other);
        while let Some(scope) = cursor {
            if scope.id == self.id {
                return true;
            }
            cursor = scope.parent.as_deref();
        }
        false
    }

    /// Record a finished task. Called by the scheduler after the task's
    /// outcome is stored.
    pub fn task_finished(&self, task: TaskId, outcome: &Outcome) {
        let mut to_cancel = Vec::new();
        let wakers = {
            let mut st = self.state.lock();
            st.live.remove(&task);
            match outcome {
                Outcome::Completed => st.completed += 1,
                Outcome::Cancelled => st.cancelled += 1,
                Outcome::Failed(cause) => {
                    let err = Error::TaskFailed {
                        task,
                        cause: Arc::new(cause.clone()),
                    };
                    debug!(scope = %self.name, "{}", err);
                    if st.first_failure.is_none() {
                        st.first_failure = Some(err.clone());
                    }
                    st.failures.push(err);
                    if self.policy == Policy::ShutdownOnFailure && !st.shutdown {
                        st.shutdown = true;
                        to_cancel = st.live.values().filter_map(Weak::upgrade).collect();
                    }
                }
            }
            st.waiters.take_all()
        };
        self.cvar.notify_all();
        wake_all(wakers);
        for task in to_cancel {
            task.cancel();
        }
    }

    fn shutdown(&self) {
        let live: Vec<_> = {
            let mut st = self.state.lock();
            st.shutdown = true;
            st.live.values().filter_map(Weak::upgrade).collect()
        };
        debug!(scope = %self.name, live = live.len(), "shutdown");
        for task in live {
            task.cancel();
        }
    }

    /// Remove this scope from its parent and from the registry.
    fn detach(&self) {
        if let Some(parent) = &self.parent {
            parent.state.lock().children.remove(&self.id);
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.scopes.remove(self);
        }
    }

    fn check_owner(&self) -> Result<()> {
        let caller = context::owner();
        if caller != self.owner {
            return Err(Violation::WrongOwner {
                scope: self.name.clone(),
                owner: self.owner,
                caller,
            }
            .into());
        }
        Ok(())
    }
}

/// Per-runtime index of open scopes, with a stack per owner for parent
/// resolution.
pub(crate) struct ScopeRegistry {
    inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    stacks: HashMap<Owner, Vec<Weak<ScopeInner>>>,
    open: BTreeMap<ScopeId, Weak<ScopeInner>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryState::default()),
        }
    }

    fn push(&self, scope: &Arc<ScopeInner>) {
        let mut reg = self.inner.lock();
        reg.stacks
            .entry(scope.owner)
            .or_default()
            .push(Arc::downgrade(scope));
        reg.open.insert(scope.id, Arc::downgrade(scope));
    }

    fn remove(&self, scope: &ScopeInner) {
        let mut reg = self.inner.lock();
        reg.open.remove(&scope.id);
        if let Some(stack) = reg.stacks.get_mut(&scope.owner) {
            stack.retain(|s| s.upgrade().is_some_and(|s| s.id != scope.id));
            if stack.is_empty() {
                reg.stacks.remove(&scope.owner);
            }
        }
    }

    fn innermost(&self, owner: Owner) -> Option<Arc<ScopeInner>> {
        let reg = self.inner.lock();
        reg.stacks
            .get(&owner)?
            .iter()
            .rev()
            .filter_map(Weak::upgrade)
            .find(|s| s.phase() != Phase::Closed)
    }

    pub fn open_scopes(&self) -> Vec<Arc<ScopeInner>> {
        self.inner
            .lock()
            .open
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

pub(crate) fn open(shared: &Arc<Shared>, name: String, policy: Policy) -> Scope {
    let owner = context::owner();
    let parent = shared
        .scopes
        .innermost(owner)
        .or_else(|| context::current_task().and_then(|t| t.header.scope.clone()))
        .filter(|p| p.phase() != Phase::Closed);

    let inner = Arc::new(ScopeInner {
        id: shared.next_scope_id(),
        name,
        policy,
        owner,
        parent,
        shared: Arc::downgrade(shared),
        state: Mutex::new(ScopeState {
            phase: Phase::Open,
            live: HashMap::new(),
            unjoined: 0,
            children: BTreeMap::new(),
            shutdown: false,
            first_failure: None,
            failures: Vec::new(),
            completed: 0,
            cancelled: 0,
            waiters: Waiters::new(),
        }),
        cvar: Condvar::new(),
    });

    if let Some(parent) = &inner.parent {
        parent
            .state
            .lock()
            .children
            .insert(inner.id, Arc::downgrade(&inner));
    }
    shared.scopes.push(&inner);
    debug!(
        scope = %inner.name,
        id = %inner.id,
        parent = ?inner.parent.as_ref().map(|p| p.id),
        owner = %owner,
        "scope opened"
    );

    Scope {
        scope: ScopeRef { inner },
    }
}

/// Shareable reference to a scope. Tasks use it to fork into the scope;
/// only the owner can join or close.
#[derive(Clone)]
pub struct ScopeRef {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("phase", &self.phase())
            .finish()
    }
}

impl ScopeRef {
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn policy(&self) -> Policy {
        self.inner.policy
    }

    pub fn owner(&self) -> Owner {
        self.inner.owner
    }

    pub fn parent(&self) -> Option<ScopeId> {
        self.inner.parent.as_ref().map(|p| p.id)
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase()
    }

    /// Tasks forked into this scope that have not finished.
    pub fn live(&self) -> usize {
        self.inner.live()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Fork a task into this scope.
    #[track_caller]
    pub fn fork<T, F>(&self, future: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let spawned_at = Location::caller();
        let inner = &self.inner;
        let closed = || Error::ScopeClosed {
            scope: inner.name.clone(),
        };
        let shared = inner.shared.upgrade().ok_or_else(closed)?;

        let caller = context::owner();
        let in_subtree = caller == inner.owner
            || context::current_task()
                .and_then(|t| t.header.scope.clone())
                .is_some_and(|s| inner.encloses(&s));

        let mut st = inner.state.lock();
        match (st.phase, in_subtree) {
            (Phase::Closed, _) | (Phase::Joining, false) => return Err(closed()),
            (Phase::Open, false) => {
                return Err(Violation::NotInScope {
                    scope: inner.name.clone(),
                    caller,
                }
                .into())
            }
            _ => {}
        }

        let (raw, handle) = build_task(&shared, Some(inner.clone()), future, spawned_at);
        if st.shutdown {
            st.cancelled += 1;
            drop(st);
            debug!(scope = %inner.name, task = %raw.id(), "fork into shut-down scope");
            raw.finish(Outcome::Cancelled);
            return Ok(handle);
        }
        st.live.insert(raw.id(), Arc::downgrade(&raw));
        st.unjoined += 1;
        drop(st);

        debug!(scope = %inner.name, task = %raw.id(), "forked");
        shared.submit(raw);
        Ok(handle)
    }

    /// Wait until every task forked into the scope has finished.
    ///
    /// Under `ShutdownOnFailure` the first failure is returned once all
    /// siblings are done. Under `CollectAll` the report carries every
    /// failure; see [`JoinReport::into_result`].
    pub async fn join(&self) -> Result<JoinReport> {
        self.join_inner(None).await
    }

    /// Like `join`, but gives up at `deadline`. Tasks keep running.
    pub async fn join_until(&self, deadline: Instant) -> Result<JoinReport> {
        self.join_inner(Some(deadline)).await
    }

    pub async fn join_timeout(&self, timeout: Duration) -> Result<JoinReport> {
        self.join_inner(Some(Instant::now() + timeout)).await
    }

    /// Join from a plain thread that owns the scope.
    pub fn join_blocking(&self) -> Result<JoinReport> {
        self.begin_join()?;
        let _lease = gate::enter_pinned(Resource::Join);
        let waited = gate::block_until(&self.inner.state, &self.inner.cvar, None, |st| {
            st.live.is_empty()
        });
        self.finish_join(waited, Duration::ZERO)
    }

    fn begin_join(&self) -> Result<()> {
        self.inner.check_owner()?;
        let mut st = self.inner.state.lock();
        match st.phase {
            Phase::Closed => Err(Error::ScopeClosed {
                scope: self.inner.name.clone(),
            }),
            _ => {
                st.phase = Phase::Joining;
                Ok(())
            }
        }
    }

    async fn join_inner(&self, deadline: Option<Instant>) -> Result<JoinReport> {
        let started = Instant::now();
        self.begin_join()?;
        debug!(scope = %self.inner.name, live = self.live(), "joining");

        let lease = gate::enter(Resource::Join);
        let waited = if lease.blocks_thread() {
            gate::block_until(&self.inner.state, &self.inner.cvar, deadline, |st| {
                st.live.is_empty()
            })
        } else {
            ScopeJoin {
                inner: self.inner.clone(),
                key: None,
                ignored: false,
                delay: deadline.map(Delay::until),
            }
            .await
        };
        drop(lease);

        let timeout = deadline.map_or(Duration::ZERO, |d| d.saturating_duration_since(started));
        self.finish_join(waited, timeout)
    }

    fn finish_join(&self, waited: Result<bool>, timeout: Duration) -> Result<JoinReport> {
        match waited {
            Ok(true) => {}
            Ok(false) => return Err(Error::TimeoutExceeded(timeout)),
            Err(e) => {
                // A cancelled owner takes its scope's tasks down with it.
                if e.is_cancelled() {
                    self.inner.shutdown();
                }
                return Err(e);
            }
        }

        let mut st = self.inner.state.lock();
        st.unjoined = 0;
        let report = JoinReport {
            completed: st.completed,
            cancelled: st.cancelled,
            failures: st.failures.clone(),
        };
        debug!(
            scope = %self.inner.name,
            completed = report.completed,
            cancelled = report.cancelled,
            failed = report.failures.len(),
            "joined"
        );
        match (&st.first_failure, self.inner.policy) {
            (Some(first), Policy::ShutdownOnFailure) => Err(first.clone()),
            _ => Ok(report),
        }
    }

    /// Close the scope. Owner only; fails while child scopes are open or
    /// tasks are live or unjoined. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.inner.check_owner()?;
        let mut st = self.inner.state.lock();
        if st.phase == Phase::Closed {
            return Ok(());
        }
        let open_children = st
            .children
            .values()
            .filter(|c| c.upgrade().is_some())
            .count();
        if open_children > 0 {
            return Err(Violation::OpenChildScopes {
                scope: self.inner.name.clone(),
                count: open_children,
            }
            .into());
        }
        if !st.live.is_empty() || st.unjoined > 0 {
            return Err(Violation::UnjoinedTasks {
                scope: self.inner.name.clone(),
                live: st.live.len(),
                unjoined: st.unjoined,
            }
            .into());
        }
        st.phase = Phase::Closed;
        drop(st);

        self.inner.detach();
        debug!(scope = %self.inner.name, "scope closed");
        Ok(())
    }

    /// Cancel every live task. Later forks are cancelled without running.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

/// Owning guard returned by `open_scope`. Dereferences to [`ScopeRef`].
///
/// Dropping a scope that was never closed cancels its live tasks, marks it
/// closed and logs a warning.
pub struct Scope {
    scope: ScopeRef,
}

impl Scope {
    /// A reference that can be moved into tasks.
    pub fn share(&self) -> ScopeRef {
        self.scope.clone()
    }
}

impl Deref for Scope {
    type Target = ScopeRef;

    fn deref(&self) -> &ScopeRef {
        &self.scope
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.scope.fmt(f)
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let inner = &self.scope.inner;
        let live = {
            let mut st = inner.state.lock();
            if st.phase == Phase::Closed {
                return;
            }
            st.phase = Phase::Closed;
            st.live.len()
        };
        warn!(scope = %inner.name, live, "scope dropped without close");
        inner.shutdown();
        inner.detach();
    }
}

struct ScopeJoin {
    inner: Arc<ScopeInner>,
    key: Option<u64>,
    ignored: bool,
    delay: Option<Delay>,
}

impl Future for ScopeJoin {
    type Output = Result<bool>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<bool>> {
        let this = &mut *self;
        observe_interrupt(&mut this.ignored)?;
        {
            let mut st = this.inner.state.lock();
            if st.live.is_empty() {
                st.waiters.remove(&mut this.key);
                return Poll::Ready(Ok(true));
            }
            st.waiters.register(&mut this.key, cx.waker());
        }
        if let Some(delay) = this.delay.as_mut() {
            if Pin::new(delay).poll(cx).is_ready() {
                return Poll::Ready(Ok(false));
            }
        }
        Poll::Pending
    }
}

impl Drop for ScopeJoin {
    fn drop(&mut self) {
        if self.key.is_some() {
            self.inner.state.lock().waiters.remove(&mut self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::sync::Latch;
    use crate::time::sleep;

    #[test]
    fn fork_join_close_from_thread_owner() {
        let rt = Runtime::with_carriers(2).unwrap();
        let scope = rt.open_scope("work", Policy::CollectAll);
        let a = scope.fork(async { Ok(1) }).unwrap();
        let b = scope.fork(async { Ok(2) }).unwrap();

        let report = scope.join_blocking().unwrap();
        assert_eq!(report.completed, 2);
        assert!(report.is_clean());
        assert_eq!(a.try_result().unwrap() + b.try_result().unwrap(), 3);
        scope.close().unwrap();
        assert_eq!(scope.phase(), Phase::Closed);
        assert!(scope.close().is_ok());
    }

    #[test]
    fn fork_into_closed_scope_fails() {
        let rt = Runtime::with_carriers(1).unwrap();
        let scope = rt.open_scope("done", Policy::CollectAll);
        scope.close().unwrap();
        let err = scope.fork(async { Ok(()) }).unwrap_err();
        assert!(matches!(err, Error::ScopeClosed { .. }));
    }

    #[test]
    fn joining_scope_only_accepts_forks_from_its_subtree() {
        let rt = Runtime::with_carriers(2).unwrap();
        let scope = rt.open_scope("joining", Policy::CollectAll);
        let release = Arc::new(Latch::new(1));

        // Forks a sibling into its own scope once the owner is joining.
        let inside = scope
            .fork({
                let scope = scope.share();
                let release = release.clone();
                async move {
                    release.wait().await?;
                    let late = scope.fork(async { Ok(2) })?;
                    late.join().await
                }
            })
            .unwrap();

        // A root task with no scope of its own.
        let outside = rt.spawn({
            let scope = scope.share();
            let release = release.clone();
            async move {
                while scope.phase() != Phase::Joining {
                    sleep(Duration::from_millis(1)).await?;
                }
                let denied = scope.fork(async { Ok(0) }).map(|_| ());
                release.count_down();
                Ok::<_, Error>(denied)
            }
        });

        let report = scope.join_blocking().unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(inside.try_result().unwrap(), 2);
        let denied = outside.join_blocking().unwrap();
        assert!(matches!(denied, Err(Error::ScopeClosed { .. })));
        scope.close().unwrap();
    }

    #[test]
    fn close_before_join_is_a_violation() {
        let rt = Runtime::with_carriers(1).unwrap();
        let scope = rt.open_scope("early", Policy::CollectAll);
        scope.fork(async { Ok(()) }).unwrap();
        let err = scope.close().unwrap_err();
        assert!(matches!(
            err,
            Error::StructureViolation(Violation::UnjoinedTasks { .. })
        ));
        scope.join_blocking().unwrap();
        scope.close().unwrap();
    }

    #[test]
    fn nested_scope_must_close_first() {
        let rt = Runtime::with_carriers(1).unwrap();
        let outer = rt.open_scope("outer", Policy::CollectAll);
        let inner = rt.open_scope("inner", Policy::CollectAll);
        assert_eq!(inner.parent(), Some(outer.id()));

        let err = outer.close().unwrap_err();
        assert!(matches!(
            err,
            Error::StructureViolation(Violation::OpenChildScopes { count: 1, .. })
        ));
        inner.close().unwrap();
        outer.close().unwrap();
    }

    #[test]
    fn collect_all_aggregates() {
        let rt = Runtime::with_carriers(2).unwrap();
        let scope = rt.open_scope("collect", Policy::CollectAll);
        scope.fork(async { Err::<(), _>(Error::failed("one")) }).unwrap();
        scope.fork(async { Ok(()) }).unwrap();
        scope.fork(async { Err::<(), _>(Error::failed("two")) }).unwrap();

        let report = scope.join_blocking().unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failures.len(), 2);
        match report.into_result() {
            Err(Error::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {:?}", other),
        }
        scope.close().unwrap();
    }

    #[test]
    fn shutdown_cancels_and_rejects_new_work() {
        let rt = Runtime::with_carriers(1).unwrap();
        let scope = rt.open_scope("stop", Policy::CollectAll);
        let slow = scope
            .fork(async {
                sleep(Duration::from_secs(30)).await?;
                Ok::<_, Error>(())
            })
            .unwrap();
        scope.shutdown();
        let late = scope.fork(async { Ok(1) }).unwrap();

        let report = scope.join_blocking().unwrap();
        assert_eq!(report.cancelled, 2);
        assert!(slow.try_result().unwrap_err().is_cancelled());
        assert!(late.try_result().unwrap_err().is_cancelled());
        scope.close().unwrap();
    }

    #[test]
    fn dropped_scope_cancels_tasks() {
        let rt = Runtime::with_carriers(1).unwrap();
        let handle = {
            let scope = rt.open_scope("abandoned", Policy::CollectAll);
            scope
                .fork(async {
                    sleep(Duration::from_secs(30)).await?;
                    Ok::<_, Error>(())
                })
                .unwrap()
        };
        assert!(handle.join_blocking().unwrap_err().is_cancelled());
    }

    #[test]
    fn join_from_other_thread_is_wrong_owner() {
        let rt = Runtime::with_carriers(1).unwrap();
        let scope = rt.open_scope("mine", Policy::CollectAll);
        let shared = scope.share();
        let err = std::thread::spawn(move || shared.close().unwrap_err())
            .join()
            .unwrap();
        assert!(matches!(
            err,
            Error::StructureViolation(Violation::WrongOwner { .. })
        ));
        scope.close().unwrap();
    }
}
