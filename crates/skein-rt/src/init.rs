// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-time initialization guards.
//!
//! `run_once(key, init)` runs `init` exactly once per key; concurrent
//! callers wait for it to finish and share its value or its failure. Waits
//! go through the gate as `Resource::InitWait`, so by default a waiting
//! task frees its carrier. Configured to pin, the same waits reproduce the
//! class-initialization deadlock of runtimes that cannot unmount a blocked
//! thread.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::cancel::observe_interrupt;
use crate::config::InitFailurePolicy;
use crate::context::{self, Owner};
use crate::error::{Error, Result, Violation};
use crate::gate::{self, Resource};
use crate::green::waiters::{wake_all, Waiters};
use crate::time::Delay;

type Value = Arc<dyn Any + Send + Sync>;

/// Observable state of one key.
#[derive(Debug, Clone)]
pub enum InitState {
    Uninitialized,
    Initializing(Owner),
    Ready,
    Failed(Error),
}

impl InitState {
    pub fn is_ready(&self) -> bool {
        matches!(self, InitState::Ready)
    }
}

struct EntryState {
    phase: InitState,
    /// Bumped each time an initializer claims the key.
    generation: u64,
    last_failure: Option<(u64, Error)>,
    value: Option<Value>,
    waiters: Waiters,
}

impl EntryState {
    /// Is generation `target` still unresolved?
    fn pending(&self, target: u64) -> bool {
        self.generation < target
            || (self.generation == target && matches!(self.phase, InitState::Initializing(_)))
    }
}

struct Entry {
    state: Mutex<EntryState>,
    cvar: Condvar,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState {
                phase: InitState::Uninitialized,
                generation: 0,
                last_failure: None,
                value: None,
                waiters: Waiters::new(),
            }),
            cvar: Condvar::new(),
        }
    }

    fn notify(&self, st: &mut EntryState) {
        let wakers = st.waiters.take_all();
        self.cvar.notify_all();
        wake_all(wakers);
    }
}

enum Step {
    Claim(u64),
    Wait(u64),
}

/// Per-runtime registry of init guards.
pub struct InitRegistry {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    policy: InitFailurePolicy,
    recheck: Duration,
}

impl InitRegistry {
    pub(crate) fn new(policy: InitFailurePolicy, recheck: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy,
            recheck,
        }
    }

    pub fn policy(&self) -> InitFailurePolicy {
        self.policy
    }

    fn entry(&self, key: &str) -> Arc<Entry> {
        self.entries
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Entry::new()))
            .clone()
    }

    /// Run `init` once for `key` and share its value with every caller.
    ///
    /// Callers that arrive while another caller is initializing wait for
    /// it. Under `Retry` a failure is reported to everyone who waited on
    /// that attempt and the next call tries again; under `Sticky` it is
    /// returned forever.
    pub async fn run_once<T, F, Fut>(&self, key: &str, init: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let entry = self.entry(key);
        let me = context::owner();

        loop {
            let step = {
                let mut guard = entry.state.lock();
                let st = &mut *guard;
                match &st.phase {
                    InitState::Ready => return downcast(key, st.value.clone()),
                    InitState::Failed(err) => return Err(err.clone()),
                    InitState::Initializing(owner) if *owner == me => {
                        return Err(Violation::RecursiveInit {
                            key: key.to_string(),
                        }
                        .into())
                    }
                    InitState::Initializing(_) => Step::Wait(st.generation),
                    InitState::Uninitialized => {
                        st.generation += 1;
                        st.phase = InitState::Initializing(me);
                        Step::Claim(st.generation)
                    }
                }
            };

            match step {
                Step::Claim(generation) => {
                    debug!(key, generation, "initializing");
                    let claim = Claim {
                        entry: &entry,
                        key,
                        generation,
                        policy: self.policy,
                        armed: true,
                    };
                    let result = init().await;
                    return claim.settle(result);
                }
                Step::Wait(generation) => {
                    self.wait(&entry, key, generation, None).await?;
                    let st = entry.state.lock();
                    match &st.phase {
                        InitState::Ready => return downcast(key, st.value.clone()),
                        InitState::Failed(err) => return Err(err.clone()),
                        _ => {
                            if let Some((failed_gen, err)) = &st.last_failure {
                                if *failed_gen == generation {
                                    return Err(err.clone());
                                }
                            }
                            // The initializer was abandoned; try to claim.
                        }
                    }
                }
            }
        }
    }

    /// Wait for `key` to become ready without initializing it.
    ///
    /// If nobody is initializing, waits for the next attempt. `timeout`
    /// bounds the wait with `TimeoutExceeded`.
    pub async fn await_ready<T>(&self, key: &str, timeout: Option<Duration>) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let entry = self.entry(key);
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let target = {
                let st = entry.state.lock();
                match &st.phase {
                    InitState::Ready => return downcast(key, st.value.clone()),
                    InitState::Failed(err) => return Err(err.clone()),
                    InitState::Initializing(_) => st.generation,
                    InitState::Uninitialized => st.generation + 1,
                }
            };
            if !self.wait(&entry, key, target, deadline).await? {
                return Err(Error::TimeoutExceeded(timeout.unwrap_or_default()));
            }
            let st = entry.state.lock();
            if let Some((failed_gen, err)) = &st.last_failure {
                if *failed_gen == target && !st.phase.is_ready() {
                    return Err(err.clone());
                }
            }
        }
    }

    /// Current state of `key`.
    pub fn state(&self, key: &str) -> InitState {
        match self.entries.lock().get(key) {
            Some(entry) => entry.state.lock().phase.clone(),
            None => InitState::Uninitialized,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Forget every key. Waiters on removed entries keep their entry alive
    /// and finish normally.
    pub fn reset(&self) {
        self.entries.lock().clear();
    }

    /// Wait until generation `target` resolves. `Ok(false)` on deadline.
    async fn wait(
        &self,
        entry: &Arc<Entry>,
        key: &str,
        target: u64,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        let lease = gate::enter(Resource::InitWait);
        if lease.blocks_thread() {
            return self.wait_blocking(entry, key, target, deadline);
        }
        InitWait {
            entry: entry.clone(),
            key,
            target,
            key_slot: None,
            ignored: false,
            recheck: Delay::new(self.recheck),
            interval: self.recheck,
            deadline: deadline.map(Delay::until),
        }
        .await
    }

    fn wait_blocking(
        &self,
        entry: &Entry,
        key: &str,
        target: u64,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        loop {
            let recheck = Instant::now() + self.recheck;
            let until = deadline.map_or(recheck, |d| d.min(recheck));
            if gate::block_until(&entry.state, &entry.cvar, Some(until), |st| {
                !st.pending(target)
            })? {
                return Ok(true);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(false);
            }
            info!("waiting for `{}`", key);
        }
    }
}

fn downcast<T: Send + Sync + 'static>(key: &str, value: Option<Value>) -> Result<Arc<T>> {
    value
        .and_then(|v| v.downcast::<T>().ok())
        .ok_or_else(|| Error::InitTypeMismatch {
            key: key.to_string(),
        })
}

/// Held by the initializing caller. Resets the key if the initializer is
/// dropped before it settles.
struct Claim<'a> {
    entry: &'a Entry,
    key: &'a str,
    generation: u64,
    policy: InitFailurePolicy,
    armed: bool,
}

impl Claim<'_> {
    fn settle<T: Send + Sync + 'static>(mut self, result: Result<T>) -> Result<Arc<T>> {
        self.armed = false;
        let mut st = self.entry.state.lock();
        let out = match result {
            Ok(value) => {
                let value = Arc::new(value);
                st.value = Some(value.clone());
                st.phase = InitState::Ready;
                debug!(key = self.key, "initialized");
                Ok(value)
            }
            Err(err) => {
                warn!(key = self.key, error = %err, "initializer failed");
                st.last_failure = Some((self.generation, err.clone()));
                st.phase = match self.policy {
                    InitFailurePolicy::Retry => InitState::Uninitialized,
                    InitFailurePolicy::Sticky => InitState::Failed(err.clone()),
                };
                Err(err)
            }
        };
        self.entry.notify(&mut st);
        out
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = self.entry.state.lock();
        if st.generation == self.generation && matches!(st.phase, InitState::Initializing(_)) {
            warn!(key = self.key, "initializer abandoned");
            st.phase = InitState::Uninitialized;
            self.entry.notify(&mut st);
        }
    }
}

struct InitWait<'a> {
    entry: Arc<Entry>,
    key: &'a str,
    target: u64,
    key_slot: Option<u64>,
    ignored: bool,
    recheck: Delay,
    interval: Duration,
    deadline: Option<Delay>,
}

impl Future for InitWait<'_> {
    type Output = Result<bool>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<bool>> {
        let this = &mut *self;
        observe_interrupt(&mut this.ignored)?;
        {
            let mut st = this.entry.state.lock();
            if !st.pending(this.target) {
                st.waiters.remove(&mut this.key_slot);
                return Poll::Ready(Ok(true));
            }
            st.waiters.register(&mut this.key_slot, cx.waker());
        }
        if let Some(deadline) = this.deadline.as_mut() {
            if Pin::new(deadline).poll(cx).is_ready() {
                return Poll::Ready(Ok(false));
            }
        }
        while Pin::new(&mut this.recheck).poll(cx).is_ready() {
            info!("waiting for `{}`", this.key);
            this.recheck.reset(Instant::now() + this.interval);
        }
        Poll::Pending
    }
}

impl Drop for InitWait<'_> {
    fn drop(&mut self) {
        if self.key_slot.is_some() {
            self.entry.state.lock().waiters.remove(&mut self.key_slot);
        }
    }
}
