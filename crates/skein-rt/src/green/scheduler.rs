// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! M:N work-stealing scheduler.
//!
//! N carrier threads each own a local queue. When idle, carriers steal
//! from peers or the global injection queue, then park on a condvar with a
//! short timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::carrier::Carrier;
use super::queue::{InjectorQueue, LocalQueue};
use super::task::{Outcome, RawTask, TaskId, TaskState};
use crate::config::RuntimeConfig;
use crate::context;
use crate::error::{Error, Violation};
use crate::gate::{Gate, Resource};
use crate::init::InitRegistry;
use crate::scope::{ScopeId, ScopeRegistry};
use crate::time::Timer;

/// State shared between carriers, the timer thread, handles and scopes.
pub(crate) struct Shared {
    pub config: RuntimeConfig,
    pub carriers: Vec<Carrier>,
    /// Per-carrier local queues. Index = carrier id.
    pub local_queues: Vec<LocalQueue>,
    /// Overflow / external spawn queue.
    pub global_queue: InjectorQueue,
    /// Submitted tasks that have not finished.
    pub active_tasks: AtomicUsize,
    /// Signalled when `active_tasks` drops to zero.
    pub all_done: (Mutex<()>, Condvar),
    pub shutdown: AtomicBool,
    /// Wakes idle carriers when new work arrives.
    pub work_available: (Mutex<bool>, Condvar),
    pub gate: Gate,
    pub timer: Timer,
    pub init: InitRegistry,
    pub scopes: ScopeRegistry,
    tasks: Mutex<HashMap<TaskId, Weak<RawTask>>>,
    next_task_id: AtomicU64,
    next_scope_id: AtomicU64,
}

impl Shared {
    pub fn new(config: RuntimeConfig) -> Self {
        let carrier_count = config.resolved_carriers();
        let carriers = (0..carrier_count)
            .map(|id| Carrier::new(id, &config.thread_name_prefix))
            .collect();
        let local_queues = (0..carrier_count)
            .map(|_| LocalQueue::new(config.local_queue_capacity))
            .collect();

        Self {
            gate: Gate::new(&config),
            init: InitRegistry::new(config.init_failure_policy, config.init_recheck_interval),
            timer: Timer::new(),
            scopes: ScopeRegistry::new(),
            carriers,
            local_queues,
            global_queue: InjectorQueue::new(),
            active_tasks: AtomicUsize::new(0),
            all_done: (Mutex::new(()), Condvar::new()),
            shutdown: AtomicBool::new(false),
            work_available: (Mutex::new(false), Condvar::new()),
            tasks: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(1),
            next_scope_id: AtomicU64::new(1),
            config,
        }
    }

    pub fn next_task_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_scope_id(&self) -> ScopeId {
        ScopeId(self.next_scope_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Hand a freshly built task to the carriers.
    pub fn submit(self: &Arc<Self>, task: Arc<RawTask>) {
        self.active_tasks.fetch_add(1, Ordering::AcqRel);
        self.tasks.lock().insert(task.id(), Arc::downgrade(&task));
        let _ = task.header.scheduler.set(Arc::downgrade(self));
        debug!(task = %task.id(), at = %task.header.spawned_at, "spawned");
        self.enqueue(task);
    }

    /// Queue a runnable task: the current carrier's local queue when called
    /// from one of our carriers, the injector otherwise.
    pub fn enqueue(self: &Arc<Self>, task: Arc<RawTask>) {
        let task = match context::is_carrier_of(self) {
            Some(id) => match self.local_queues[id].push(task) {
                Ok(()) => {
                    self.notify_one();
                    return;
                }
                Err(overflow) => overflow,
            },
            None => task,
        };
        self.global_queue.push(task);
        self.notify_one();
    }

    fn notify_one(&self) {
        let (lock, cvar) = &self.work_available;
        let mut ready = lock.lock();
        *ready = true;
        cvar.notify_one();
    }

    pub fn notify_all(&self) {
        let (lock, cvar) = &self.work_available;
        let mut ready = lock.lock();
        *ready = true;
        cvar.notify_all();
    }

    /// Tasks waiting in any queue.
    pub fn runnable(&self) -> usize {
        self.global_queue.len() + self.local_queues.iter().map(|q| q.len()).sum::<usize>()
    }

    /// Every task that has been submitted and not yet finished.
    pub fn live_tasks(&self) -> Vec<Arc<RawTask>> {
        let mut tasks: Vec<_> = self.tasks.lock().values().filter_map(Weak::upgrade).collect();
        tasks.sort_by_key(|t| t.id());
        tasks
    }

    /// Feed the current pinned/runnable counts to the gate.
    pub fn check_saturation(&self) {
        self.gate
            .evaluate(self.gate.pinned(), self.carriers.len(), self.runnable());
    }

    fn complete(&self, task: &Arc<RawTask>, outcome: Outcome) {
        debug!(task = %task.id(), state = ?outcome.state(), "finished");
        task.finish(outcome.clone());
        if let Some(scope) = &task.header.scope {
            scope.task_finished(task.id(), &outcome);
        }
        self.tasks.lock().remove(&task.id());

        let prev = self.active_tasks.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            let (lock, cvar) = &self.all_done;
            let _guard = lock.lock();
            cvar.notify_all();
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.timer.shutdown();
        self.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Simple xorshift64 for random victim selection.
fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// Carrier main loop.
pub(crate) fn carrier_loop(id: usize, shared: Arc<Shared>) {
    context::enter_carrier(shared.clone(), id);
    debug!(carrier = %shared.carriers[id].name, "carrier started");

    let local = &shared.local_queues[id];
    let count = shared.carriers.len();
    let mut rng = (id as u64).wrapping_add(0x9E3779B97F4A7C15);

    loop {
        // 1. Local queue.
        if let Some(task) = local.pop() {
            run_task(task, &shared, id);
            continue;
        }

        // 2. Steal from a random peer.
        if count > 1 {
            let victim = (xorshift64(&mut rng) as usize) % count;
            if victim != id {
                let mut stolen = shared.local_queues[victim].steal_batch().into_iter();
                if let Some(first) = stolen.next() {
                    for task in stolen {
                        if let Err(task) = local.push(task) {
                            shared.global_queue.push(task);
                        }
                    }
                    run_task(first, &shared, id);
                    continue;
                }
            }
        }

        // 3. Global injection queue.
        if let Some(task) = shared.global_queue.pop() {
            run_task(task, &shared, id);
            continue;
        }

        // 4. Exit once shut down and our queue is drained.
        if shared.is_shutdown() {
            while let Some(task) = local.pop() {
                run_task(task, &shared, id);
            }
            break;
        }

        // 5. Park until new work arrives.
        let (lock, cvar) = &shared.work_available;
        let mut ready = lock.lock();
        if !*ready {
            // Bounded so peers' local queues get stolen from even without a notify.
            cvar.wait_for(&mut ready, shared.config.idle_park);
        }
        *ready = false;
    }

    debug!(carrier = %shared.carriers[id].name, "carrier stopped");
    context::leave_carrier();
}

/// Poll a single task on carrier `id`.
fn run_task(task: Arc<RawTask>, shared: &Arc<Shared>, id: usize) {
    if task.state().is_terminal() {
        return;
    }

    let carrier = &shared.carriers[id];
    task.set_state(TaskState::Running);
    task.header.notified.store(false, Ordering::SeqCst);
    carrier.bind(task.id());
    trace!(task = %task.id(), carrier = %carrier.name, "polling");

    let polled = context::with_task(&task, || task.poll());
    carrier.unbind();

    match polled {
        Some(outcome) => shared.complete(&task, outcome),
        // Suspending inside a pinning region would strand the task and its
        // pin count. Dropping the future ends the lease.
        None if task.state() == TaskState::Pinned => {
            let resource = task.blocked_on().unwrap_or(Resource::Native);
            warn!(task = %task.id(), resource = %resource, "task suspended while pinned");
            let err = Error::from(Violation::SuspendedWhilePinned { resource });
            shared.complete(&task, Outcome::Failed(err));
        }
        None => {
            // Running -> Parked, then pick up any wake that fired during the poll.
            if task.transition(TaskState::Running, TaskState::Parked)
                && task.header.notified.load(Ordering::SeqCst)
                && task.transition(TaskState::Parked, TaskState::Runnable)
            {
                shared.enqueue(task);
            }
        }
    }
}
