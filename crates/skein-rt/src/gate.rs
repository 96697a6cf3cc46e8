// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Blocking-operation gate.
//!
//! Every wait primitive enters the gate before it waits. The resource kind
//! decides whether the wait parks the task cooperatively (carrier freed) or
//! pins the carrier for the whole wait. Pinned carriers are counted, and a
//! pool that is close to fully pinned while work is queued gets a
//! `DeadlockRisk` diagnostic.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::observe_interrupt;
use crate::config::RuntimeConfig;
use crate::context;
use crate::error::{Error, Result};
use crate::green::scheduler::Shared;
use crate::green::task::{RawTask, TaskState};

/// How often a pinned wait wakes up to look for cancellation and deadlines.
pub(crate) const PINNED_TICK: Duration = Duration::from_millis(10);

const MAX_DIAGNOSTICS: usize = 64;

/// What a task is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Lock,
    Latch,
    Semaphore,
    Join,
    InitWait,
    Sleep,
    /// Intrinsic monitor (`Mutex::synchronized`).
    Monitor,
    /// Foreign or OS-level blocking call.
    Native,
}

impl Resource {
    pub const ALL: [Resource; 8] = [
        Resource::Lock,
        Resource::Latch,
        Resource::Semaphore,
        Resource::Join,
        Resource::InitWait,
        Resource::Sleep,
        Resource::Monitor,
        Resource::Native,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Resource::Lock => "lock",
            Resource::Latch => "latch",
            Resource::Semaphore => "semaphore",
            Resource::Join => "join",
            Resource::InitWait => "init_wait",
            Resource::Sleep => "sleep",
            Resource::Monitor => "monitor",
            Resource::Native => "native",
        }
    }

    /// Monitors and native calls cannot release their carrier.
    pub fn default_pins(self) -> bool {
        matches!(self, Resource::Monitor | Resource::Native)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-runtime gate state: pin flags, pinned count, diagnostics.
pub struct Gate {
    pins: RwLock<BTreeMap<Resource, bool>>,
    pinned: AtomicUsize,
    margin: usize,
    at_risk: AtomicBool,
    diagnostics: Mutex<VecDeque<Error>>,
}

impl Gate {
    pub(crate) fn new(config: &RuntimeConfig) -> Self {
        let pins = Resource::ALL
            .iter()
            .map(|&r| (r, config.pins(r)))
            .collect();
        Self {
            pins: RwLock::new(pins),
            pinned: AtomicUsize::new(0),
            margin: config.saturation_margin,
            at_risk: AtomicBool::new(false),
            diagnostics: Mutex::new(VecDeque::new()),
        }
    }

    /// Does a wait on `resource` pin its carrier?
    pub fn pins(&self, resource: Resource) -> bool {
        self.pins
            .read()
            .get(&resource)
            .copied()
            .unwrap_or_else(|| resource.default_pins())
    }

    /// Change the pin flag for later waits. Waits already in progress keep
    /// the mode they entered with.
    pub fn set_pins(&self, resource: Resource, pins: bool) {
        self.pins.write().insert(resource, pins);
    }

    /// Carriers currently held by pinned waits.
    pub fn pinned(&self) -> usize {
        self.pinned.load(Ordering::Acquire)
    }

    /// Recorded `DeadlockRisk` diagnostics, oldest first.
    pub fn diagnostics(&self) -> Vec<Error> {
        self.diagnostics.lock().iter().cloned().collect()
    }

    pub fn clear_diagnostics(&self) {
        self.diagnostics.lock().clear();
    }

    /// Record a diagnostic when the pool crosses into saturation.
    ///
    /// Only the transition is recorded; staying saturated is one event.
    pub(crate) fn evaluate(&self, pinned: usize, carriers: usize, runnable: usize) {
        let risk = pinned > 0 && pinned + self.margin >= carriers && runnable > 0;
        if !risk {
            self.at_risk.store(false, Ordering::Release);
            return;
        }
        if self.at_risk.swap(true, Ordering::AcqRel) {
            return;
        }

        let diag = Error::DeadlockRisk {
            pinned,
            carriers,
            runnable,
        };
        warn!("{}", diag);
        let mut diagnostics = self.diagnostics.lock();
        if diagnostics.len() == MAX_DIAGNOSTICS {
            diagnostics.pop_front();
        }
        diagnostics.push_back(diag);
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("pinned", &self.pinned())
            .field("margin", &self.margin)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Not on a carrier of a runtime; the caller blocks its own thread.
    Detached,
    Cooperative,
    Pinned,
    /// Entered while the task already holds a pinned lease.
    Nested,
}

/// An active blocking region. Ends on `exit` or drop.
pub struct Lease {
    resource: Resource,
    mode: Mode,
    task: Option<Arc<RawTask>>,
    shared: Option<Arc<Shared>>,
    carrier: Option<usize>,
    /// What the task was blocked on before this lease.
    restore: Option<Resource>,
}

impl Lease {
    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// The wait holds its carrier (or runs outside any runtime) and must
    /// block the OS thread.
    pub fn blocks_thread(&self) -> bool {
        self.mode != Mode::Cooperative
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self.mode, Mode::Pinned | Mode::Nested)
    }

    pub fn exit(self) {}

    fn detached(resource: Resource) -> Self {
        Self {
            resource,
            mode: Mode::Detached,
            task: None,
            shared: None,
            carrier: None,
            restore: None,
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.set_blocked_on(self.restore);
        }
        if self.mode != Mode::Pinned {
            return;
        }
        if let Some(task) = &self.task {
            task.transition(TaskState::Pinned, TaskState::Running);
        }
        if let Some(shared) = &self.shared {
            if let Some(id) = self.carrier {
                shared.carriers[id].set_pinned(false);
            }
            shared.gate.pinned.fetch_sub(1, Ordering::AcqRel);
            debug!(resource = %self.resource, "unpinned");
            shared.check_saturation();
        }
    }
}

/// Enter a blocking region for `resource`, pinning if the gate says so.
pub fn enter(resource: Resource) -> Lease {
    match (context::current_shared(), context::current_task()) {
        (Some(shared), Some(task)) => {
            if shared.gate.pins(resource) {
                pin(shared, task, resource)
            } else {
                task.set_blocked_on(Some(resource));
                Lease {
                    resource,
                    mode: Mode::Cooperative,
                    task: Some(task),
                    shared: Some(shared),
                    carrier: None,
                    restore: None,
                }
            }
        }
        _ => Lease::detached(resource),
    }
}

/// Enter a region that has no suspension point, such as a synchronous
/// wait called from task code. Always pins when on a carrier.
pub fn enter_pinned(resource: Resource) -> Lease {
    match (context::current_shared(), context::current_task()) {
        (Some(shared), Some(task)) => pin(shared, task, resource),
        _ => Lease::detached(resource),
    }
}

fn pin(shared: Arc<Shared>, task: Arc<RawTask>, resource: Resource) -> Lease {
    if task.state() == TaskState::Pinned {
        // The carrier is already counted; only the reported resource changes.
        let restore = task.blocked_on();
        task.set_blocked_on(Some(resource));
        return Lease {
            resource,
            mode: Mode::Nested,
            task: Some(task),
            shared: None,
            carrier: None,
            restore,
        };
    }
    let carrier = context::current_carrier();
    if let Some(id) = carrier {
        shared.carriers[id].set_pinned(true);
    }
    task.set_state(TaskState::Pinned);
    task.set_blocked_on(Some(resource));
    shared.gate.pinned.fetch_add(1, Ordering::AcqRel);
    debug!(task = %task.id(), resource = %resource, "pinned");
    shared.check_saturation();
    Lease {
        resource,
        mode: Mode::Pinned,
        task: Some(task),
        shared: Some(shared),
        carrier,
        restore: None,
    }
}

/// Run a native blocking call. Its carrier stays pinned until it returns.
pub fn native<R>(f: impl FnOnce() -> R) -> R {
    let _lease = enter(Resource::Native);
    f()
}

/// Block the OS thread until `ready` holds, the deadline passes (`Ok(false)`)
/// or the current task is cancelled.
pub(crate) fn block_until<S>(
    state: &Mutex<S>,
    cvar: &Condvar,
    deadline: Option<Instant>,
    mut ready: impl FnMut(&mut S) -> bool,
) -> Result<bool> {
    let mut ignored = false;
    let mut guard = state.lock();
    loop {
        if ready(&mut *guard) {
            return Ok(true);
        }
        observe_interrupt(&mut ignored)?;
        let now = Instant::now();
        let mut wake_at = now + PINNED_TICK;
        if let Some(deadline) = deadline {
            if now >= deadline {
                return Ok(false);
            }
            wake_at = wake_at.min(deadline);
        }
        cvar.wait_until(&mut guard, wake_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pins() {
        let pinning: Vec<_> = Resource::ALL
            .iter()
            .filter(|r| r.default_pins())
            .map(|r| r.name())
            .collect();
        assert_eq!(pinning, vec!["monitor", "native"]);
    }

    #[test]
    fn set_pins_overrides_config() {
        let gate = Gate::new(&RuntimeConfig::default().pin(Resource::Sleep, true));
        assert!(gate.pins(Resource::Sleep));
        gate.set_pins(Resource::Sleep, false);
        assert!(!gate.pins(Resource::Sleep));
        assert!(gate.pins(Resource::Monitor));
    }

    #[test]
    fn deadlock_risk_on_transition_only() {
        let gate = Gate::new(&RuntimeConfig::default().saturation_margin(0));
        gate.evaluate(2, 4, 10);
        assert!(gate.diagnostics().is_empty());

        gate.evaluate(4, 4, 3);
        gate.evaluate(4, 4, 5);
        let diags = gate.diagnostics();
        assert_eq!(diags.len(), 1);
        assert!(matches!(
            diags[0],
            Error::DeadlockRisk {
                pinned: 4,
                carriers: 4,
                runnable: 3
            }
        ));

        // Recovery re-arms the check.
        gate.evaluate(4, 4, 0);
        gate.evaluate(4, 4, 1);
        assert_eq!(gate.diagnostics().len(), 2);
    }

    #[test]
    fn margin_counts_towards_saturation() {
        let gate = Gate::new(&RuntimeConfig::default().saturation_margin(1));
        gate.evaluate(3, 4, 1);
        assert_eq!(gate.diagnostics().len(), 1);
        gate.clear_diagnostics();
        assert!(gate.diagnostics().is_empty());
    }

    #[test]
    fn leases_outside_runtime_are_detached() {
        let lease = enter(Resource::Latch);
        assert!(lease.blocks_thread());
        assert!(!lease.is_pinned());
        assert_eq!(lease.resource(), Resource::Latch);
        lease.exit();
        assert_eq!(native(|| 7), 7);
    }

    #[test]
    fn block_until_times_out() {
        let state = Mutex::new(false);
        let cvar = Condvar::new();
        let start = Instant::now();
        let done = block_until(
            &state,
            &cvar,
            Some(start + Duration::from_millis(30)),
            |ready| *ready,
        )
        .unwrap();
        assert!(!done);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
