// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime construction, spawning and shutdown.
//!
//! A `Runtime` owns its carrier threads, the timer thread and every
//! registry (gate, init guards, scopes). Nothing is global; code running
//! on a carrier finds its runtime through `Handle::current`.

use std::future::Future;
use std::panic::Location;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::context;
use crate::error::{Error, Result, Violation};
use crate::gate::Gate;
use crate::green::handle::{build_task, TaskHandle};
use crate::green::scheduler::{carrier_loop, Shared};
use crate::init::InitRegistry;
use crate::scope::{self, Policy, Scope};
use crate::snapshot::RuntimeSnapshot;
use crate::time::timer_loop;

/// How long `Drop` waits for outstanding tasks before cancelling them.
const DROP_GRACE: Duration = Duration::from_secs(1);

/// Cheap, cloneable reference to a running runtime.
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("carriers", &self.shared.carriers.len())
            .finish()
    }
}

impl Handle {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Handle of the runtime driving the current carrier.
    pub fn current() -> Result<Self> {
        context::current_handle()
            .ok_or(Error::StructureViolation(Violation::NotInRuntime {
                op: "Handle::current",
            }))
    }

    pub fn try_current() -> Option<Self> {
        context::current_handle()
    }

    /// Spawn a task that belongs to no scope.
    #[track_caller]
    pub fn spawn<T, F>(&self, future: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (raw, handle) = build_task(&self.shared, None, future, Location::caller());
        self.shared.submit(raw);
        handle
    }

    /// Open a scope owned by the caller. Its parent is the caller's
    /// innermost open scope, else the scope of the current task.
    pub fn open_scope(&self, name: impl Into<String>, policy: Policy) -> Scope {
        scope::open(&self.shared, name.into(), policy)
    }

    pub fn init_registry(&self) -> &InitRegistry {
        &self.shared.init
    }

    pub fn gate(&self) -> &Gate {
        &self.shared.gate
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn carriers(&self) -> usize {
        self.shared.carriers.len()
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot::capture(&self.shared)
    }
}

/// The runtime: carrier pool plus timer thread.
#[derive(Debug)]
pub struct Runtime {
    handle: Handle,
    threads: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(config));
        let mut runtime = Self {
            handle: Handle::from_shared(shared.clone()),
            threads: Vec::with_capacity(shared.carriers.len() + 1),
        };

        for id in 0..shared.carriers.len() {
            let worker = shared.clone();
            let spawned = thread::Builder::new()
                .name(shared.carriers[id].name.clone())
                .spawn(move || carrier_loop(id, worker));
            runtime.track(spawned)?;
        }
        let timer = shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-timer", shared.config.thread_name_prefix))
            .spawn(move || timer_loop(timer));
        runtime.track(spawned)?;

        info!(carriers = shared.carriers.len(), "runtime started");
        Ok(runtime)
    }

    /// Defaults plus `SKEIN_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::new(RuntimeConfig::from_env()?)
    }

    pub fn with_carriers(carriers: usize) -> Result<Self> {
        Self::new(RuntimeConfig::default().carriers(carriers))
    }

    fn track(&mut self, spawned: std::io::Result<JoinHandle<()>>) -> Result<()> {
        match spawned {
            Ok(thread) => {
                self.threads.push(thread);
                Ok(())
            }
            Err(e) => {
                // Carriers already started exit once they see the flag.
                self.handle.shared.begin_shutdown();
                Err(Error::Spawn(e.to_string()))
            }
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.handle.config()
    }

    #[track_caller]
    pub fn spawn<T, F>(&self, future: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run `future` as a root task and block this thread until it finishes.
    #[track_caller]
    pub fn block_on<T, F>(&self, future: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let root = self.handle.spawn(future);
        match root.join_blocking() {
            // Unwrap the root task's own failure; there is no parent to attribute it to.
            Err(Error::TaskFailed { cause, .. }) => Err((*cause).clone()),
            other => other,
        }
    }

    pub fn open_scope(&self, name: impl Into<String>, policy: Policy) -> Scope {
        self.handle.open_scope(name, policy)
    }

    pub fn init_registry(&self) -> &InitRegistry {
        self.handle.init_registry()
    }

    pub fn gate(&self) -> &Gate {
        self.handle.gate()
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.handle.snapshot()
    }

    /// Wait for every task to finish, then stop all threads.
    pub fn shutdown(mut self) {
        self.stop(None);
    }

    /// Wait up to `timeout` for tasks to finish, cancel whatever is left,
    /// then stop. Returns true if everything finished in time.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> bool {
        self.stop(Some(timeout))
    }

    fn stop(&mut self, timeout: Option<Duration>) -> bool {
        if self.threads.is_empty() {
            return true;
        }
        let shared = self.handle.shared.clone();
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut clean = wait_idle(&shared, deadline);
        if !clean {
            let live = shared.live_tasks();
            warn!(live = live.len(), "shutdown timed out, cancelling remaining tasks");
            for task in &live {
                task.cancel();
            }
            wait_idle(&shared, Some(Instant::now() + DROP_GRACE));
        }

        shared.begin_shutdown();
        let join_deadline = Instant::now() + DROP_GRACE;
        for thread in self.threads.drain(..) {
            // A carrier stuck in a pinned wait that ignores interrupts is left behind.
            while !thread.is_finished() && Instant::now() < join_deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if thread.is_finished() {
                let _ = thread.join();
            } else {
                clean = false;
                warn!(thread = ?thread.thread().name(), "thread did not stop, detaching");
            }
        }
        info!(clean, "runtime stopped");
        clean
    }
}

fn wait_idle(shared: &Shared, deadline: Option<Instant>) -> bool {
    let (lock, cvar) = &shared.all_done;
    let mut guard = lock.lock();
    while shared.active_tasks.load(Ordering::Acquire) > 0 {
        match deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return false;
                }
                cvar.wait_until(&mut guard, deadline);
            }
            None => {
                cvar.wait_for(&mut guard, Duration::from_millis(50));
            }
        }
    }
    true
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop(Some(DROP_GRACE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::sleep;

    #[test]
    fn block_on_returns_value() {
        let rt = Runtime::with_carriers(2).unwrap();
        assert_eq!(rt.block_on(async { Ok(3 * 7) }).unwrap(), 21);
    }

    #[test]
    fn block_on_unwraps_root_failure() {
        let rt = Runtime::with_carriers(1).unwrap();
        let err = rt
            .block_on(async { Err::<(), _>(Error::failed("bad input")) })
            .unwrap_err();
        assert!(matches!(err, Error::Failed(ref m) if m == "bad input"));
    }

    #[test]
    fn current_handle_inside_tasks_only() {
        assert!(Handle::try_current().is_none());
        assert!(matches!(
            Handle::current(),
            Err(Error::StructureViolation(Violation::NotInRuntime { .. }))
        ));
        let rt = Runtime::with_carriers(1).unwrap();
        let carriers = rt
            .block_on(async { Ok::<_, Error>(Handle::current()?.carriers()) })
            .unwrap();
        assert_eq!(carriers, 1);
    }

    #[test]
    fn carrier_threads_are_named() {
        let rt = Runtime::new(RuntimeConfig::default().carriers(1).thread_name_prefix("worker"))
            .unwrap();
        let name = rt
            .block_on(async { Ok(thread::current().name().map(str::to_string)) })
            .unwrap();
        assert_eq!(name.as_deref(), Some("worker-0"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = Runtime::new(RuntimeConfig::default().local_queue_capacity(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn shutdown_timeout_cancels_stragglers() {
        let rt = Runtime::with_carriers(1).unwrap();
        let _h = rt.spawn(async {
            sleep(Duration::from_secs(60)).await?;
            Ok::<_, Error>(())
        });
        let start = Instant::now();
        assert!(!rt.shutdown_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
