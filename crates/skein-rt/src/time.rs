// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep, deadlines and timeouts.
//!
//! One timer thread per runtime keeps a deadline heap and wakes tasks whose
//! deadline passed. The same thread runs the gate's saturation watchdog.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::cancel::observe_interrupt;
use crate::context;
use crate::error::{Error, Result};
use crate::gate::{self, Resource, PINNED_TICK};
use crate::green::scheduler::Shared;
use crate::green::waiters::wake_all;

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    wakers: HashMap<u64, Waker>,
    next_key: u64,
    shutdown: bool,
}

/// Deadline heap driven by the timer thread.
pub(crate) struct Timer {
    state: Mutex<TimerState>,
    cvar: Condvar,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TimerState::default()),
            cvar: Condvar::new(),
        }
    }

    /// Register or refresh the waker for `key`, allocating a key on first use.
    fn register(&self, deadline: Instant, key: &mut Option<u64>, waker: &Waker) {
        let mut st = self.state.lock();
        match *key {
            Some(k) => match st.wakers.get_mut(&k) {
                Some(existing) if existing.will_wake(waker) => {}
                Some(existing) => *existing = waker.clone(),
                // Fired already; the heap entry is gone.
                None => {
                    st.wakers.insert(k, waker.clone());
                    st.heap.push(Reverse((deadline, k)));
                    self.cvar.notify_one();
                }
            },
            None => {
                st.next_key += 1;
                let k = st.next_key;
                *key = Some(k);
                st.wakers.insert(k, waker.clone());
                st.heap.push(Reverse((deadline, k)));
                self.cvar.notify_one();
            }
        }
    }

    fn cancel(&self, key: u64) {
        self.state.lock().wakers.remove(&key);
    }

    pub fn pending(&self) -> usize {
        self.state.lock().wakers.len()
    }

    pub fn shutdown(&self) {
        let mut st = self.state.lock();
        st.shutdown = true;
        let wakers: Vec<_> = st.wakers.drain().map(|(_, w)| w).collect();
        st.heap.clear();
        drop(st);
        self.cvar.notify_all();
        wake_all(wakers);
    }
}

/// Timer thread main loop.
pub(crate) fn timer_loop(shared: Arc<Shared>) {
    let watchdog = shared.config.watchdog_interval;
    let mut next_watch = Instant::now() + watchdog;
    debug!("timer started");

    loop {
        let mut due = Vec::new();
        {
            let mut st = shared.timer.state.lock();
            if st.shutdown {
                break;
            }
            let now = Instant::now();
            while let Some(&Reverse((at, key))) = st.heap.peek() {
                if at > now {
                    break;
                }
                st.heap.pop();
                if let Some(waker) = st.wakers.remove(&key) {
                    due.push(waker);
                }
            }
            if due.is_empty() && now < next_watch {
                let wake_at = st
                    .heap
                    .peek()
                    .map(|Reverse((at, _))| *at)
                    .map_or(next_watch, |at| at.min(next_watch));
                shared.timer.cvar.wait_until(&mut st, wake_at);
                continue;
            }
        }

        if !due.is_empty() {
            trace!(count = due.len(), "timers fired");
            wake_all(due);
        }
        let now = Instant::now();
        if now >= next_watch {
            shared.check_saturation();
            next_watch = now + watchdog;
        }
    }
    debug!("timer stopped");
}

/// Future that completes at a deadline. Holds no carrier while pending.
///
/// Outside a runtime a helper thread sleeps and wakes the poller.
pub struct Delay {
    deadline: Instant,
    key: Option<u64>,
    shared: Option<Arc<Shared>>,
    fallback: bool,
}

impl Delay {
    pub fn new(duration: Duration) -> Self {
        Self::until(Instant::now() + duration)
    }

    pub fn until(deadline: Instant) -> Self {
        Self {
            deadline,
            key: None,
            shared: None,
            fallback: false,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Move the deadline. A registered timer entry is dropped.
    pub fn reset(&mut self, deadline: Instant) {
        self.clear();
        self.deadline = deadline;
        self.fallback = false;
    }

    fn clear(&mut self) {
        if let (Some(key), Some(shared)) = (self.key.take(), self.shared.as_ref()) {
            shared.timer.cancel(key);
        }
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if Instant::now() >= this.deadline {
            this.clear();
            return Poll::Ready(());
        }

        if this.shared.is_none() {
            this.shared = context::current_shared();
        }
        match &this.shared {
            Some(shared) => shared.timer.register(this.deadline, &mut this.key, cx.waker()),
            None if !this.fallback => {
                this.fallback = true;
                let waker = cx.waker().clone();
                let remaining = this.deadline.saturating_duration_since(Instant::now());
                thread::spawn(move || {
                    thread::sleep(remaining);
                    waker.wake();
                });
            }
            None => {}
        }
        Poll::Pending
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Cancellation-aware sleep future.
struct Sleep {
    delay: Delay,
    ignored: bool,
}

impl Future for Sleep {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = &mut *self;
        observe_interrupt(&mut this.ignored)?;
        Pin::new(&mut this.delay).poll(cx).map(Ok)
    }
}

/// Sleep for `duration`. Cancellation ends the sleep early with `Cancelled`.
pub async fn sleep(duration: Duration) -> Result<()> {
    sleep_until(Instant::now() + duration).await
}

pub async fn sleep_until(deadline: Instant) -> Result<()> {
    let lease = gate::enter(Resource::Sleep);
    if lease.blocks_thread() {
        return sleep_blocking(deadline);
    }
    Sleep {
        delay: Delay::until(deadline),
        ignored: false,
    }
    .await
}

fn sleep_blocking(deadline: Instant) -> Result<()> {
    let mut ignored = false;
    loop {
        observe_interrupt(&mut ignored)?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep((deadline - now).min(PINNED_TICK));
    }
}

/// Future returned by [`timeout`].
pub struct Timeout<F> {
    future: Pin<Box<F>>,
    delay: Delay,
    duration: Duration,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Poll::Ready(out) = this.future.as_mut().poll(cx) {
            return Poll::Ready(Ok(out));
        }
        match Pin::new(&mut this.delay).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Error::TimeoutExceeded(this.duration))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Race `future` against a deadline. On expiry the future is dropped and
/// `TimeoutExceeded` returned; work it started elsewhere keeps running.
pub fn timeout<F: Future>(duration: Duration, future: F) -> Timeout<F> {
    Timeout {
        future: Box::pin(future),
        delay: Delay::new(duration),
        duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::Wake;

    struct Flag(AtomicBool, thread::Thread);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
            self.1.unpark();
        }
    }

    /// Minimal single-future driver for tests outside a runtime.
    fn drive<F: Future>(fut: F) -> F::Output {
        let flag = Arc::new(Flag(AtomicBool::new(false), thread::current()));
        let waker = Waker::from(flag.clone());
        let mut cx = Context::from_waker(&waker);
        let mut fut = Box::pin(fut);
        loop {
            if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
                return out;
            }
            while !flag.0.swap(false, Ordering::SeqCst) {
                thread::park_timeout(Duration::from_millis(5));
            }
        }
    }

    #[test]
    fn delay_outside_runtime() {
        let start = Instant::now();
        drive(Delay::new(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn sleep_outside_runtime_blocks_thread() {
        let start = Instant::now();
        drive(sleep(Duration::from_millis(15))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn timeout_fires() {
        let err = drive(timeout(
            Duration::from_millis(10),
            Delay::new(Duration::from_secs(5)),
        ))
        .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn timeout_passes_value_through() {
        assert_eq!(
            drive(timeout(Duration::from_secs(1), async { 5 })).unwrap(),
            5
        );
    }

    #[test]
    fn timer_registers_and_cancels() {
        let timer = Timer::new();
        let flag = Arc::new(Flag(AtomicBool::new(false), thread::current()));
        let waker = Waker::from(flag);
        let mut key = None;
        timer.register(Instant::now() + Duration::from_secs(60), &mut key, &waker);
        timer.register(Instant::now() + Duration::from_secs(60), &mut key, &waker);
        assert_eq!(timer.pending(), 1);
        timer.cancel(key.unwrap());
        assert_eq!(timer.pending(), 0);
    }
}
