// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task handles and spawning.
//!
//! A handle can be joined from a task (`join().await`, cooperative) or
//! from a plain thread (`join_blocking`). Dropping a handle detaches the
//! task; its scope, if any, still tracks it.

use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use super::scheduler::Shared;
use super::task::{Outcome, RawTask, ResultSlot, TaskId, TaskState};
use crate::cancel::observe_interrupt;
use crate::context;
use crate::error::{Error, Result};
use crate::gate::{self, Resource};
use crate::scope::ScopeInner;
use crate::time::Delay;

/// Handle to a spawned or forked task.
pub struct TaskHandle<T> {
    raw: Arc<RawTask>,
    result: Arc<ResultSlot<T>>,
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.raw.id())
            .field("state", &self.raw.state())
            .finish()
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.raw.id()
    }

    pub fn state(&self) -> TaskState {
        self.raw.state()
    }

    pub fn is_finished(&self) -> bool {
        self.raw.header.join.lock().done
    }

    /// Request cooperative cancellation. Returns false if the task already
    /// finished or was already cancelled.
    pub fn cancel(&self) -> bool {
        self.raw.cancel()
    }

    /// Wait for the task and take its result.
    pub async fn join(self) -> Result<T> {
        wait_done(&self.raw, None).await?;
        self.take_result()
    }

    /// Wait at most `timeout`. On expiry the task keeps running and the
    /// handle can be joined again.
    pub async fn join_timeout(&self, timeout: Duration) -> Result<T> {
        if !wait_done(&self.raw, Some(timeout)).await? {
            return Err(Error::TimeoutExceeded(timeout));
        }
        self.take_result()
    }

    /// Block the calling OS thread until the task finishes.
    ///
    /// Called from task code this pins the carrier for the whole wait.
    pub fn join_blocking(self) -> Result<T> {
        let _lease = gate::enter_pinned(Resource::Join);
        gate::block_until(&self.raw.header.join, &self.raw.header.join_cvar, None, |j| j.done)?;
        self.take_result()
    }

    /// Non-blocking: the result if the task finished, `NotFinished` otherwise.
    pub fn try_result(&self) -> Result<T> {
        self.take_result()
    }

    fn take_result(&self) -> Result<T> {
        let task = self.raw.id();
        match self.raw.outcome() {
            None => Err(Error::NotFinished { task }),
            Some(Outcome::Completed) => self
                .result
                .take()
                .ok_or_else(|| Error::failed(format!("result of {} was already taken", task))),
            Some(Outcome::Failed(cause)) => Err(Error::TaskFailed {
                task,
                cause: Arc::new(cause),
            }),
            Some(Outcome::Cancelled) => Err(Error::TaskFailed {
                task,
                cause: Arc::new(Error::Cancelled),
            }),
        }
    }
}

/// Join every handle in order.
pub async fn join_all<T: Send + 'static>(handles: Vec<TaskHandle<T>>) -> Vec<Result<T>> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.join().await);
    }
    results
}

/// Wait until `raw` is terminal. `Ok(false)` means the timeout expired.
async fn wait_done(raw: &Arc<RawTask>, timeout: Option<Duration>) -> Result<bool> {
    let deadline = timeout.map(|d| Instant::now() + d);
    let lease = gate::enter(Resource::Join);
    if lease.blocks_thread() {
        return gate::block_until(&raw.header.join, &raw.header.join_cvar, deadline, |j| j.done);
    }
    JoinFuture {
        raw: raw.clone(),
        key: None,
        ignored: false,
        delay: deadline.map(Delay::until),
    }
    .await
}

struct JoinFuture {
    raw: Arc<RawTask>,
    key: Option<u64>,
    ignored: bool,
    delay: Option<Delay>,
}

impl Future for JoinFuture {
    type Output = Result<bool>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<bool>> {
        let this = &mut *self;
        observe_interrupt(&mut this.ignored)?;
        {
            let mut join = this.raw.header.join.lock();
            if join.done {
                join.waiters.remove(&mut this.key);
                return Poll::Ready(Ok(true));
            }
            join.waiters.register(&mut this.key, cx.waker());
        }
        if let Some(delay) = this.delay.as_mut() {
            if Pin::new(delay).poll(cx).is_ready() {
                return Poll::Ready(Ok(false));
            }
        }
        Poll::Pending
    }
}

impl Drop for JoinFuture {
    fn drop(&mut self) {
        if self.key.is_some() {
            self.raw.header.join.lock().waiters.remove(&mut self.key);
        }
    }
}

/// Build a task around `future`. The caller submits it (or finishes it
/// as cancelled) after registering it wherever it belongs.
pub(crate) fn build_task<T, F>(
    shared: &Arc<Shared>,
    scope: Option<Arc<ScopeInner>>,
    future: F,
    spawned_at: &'static Location<'static>,
) -> (Arc<RawTask>, TaskHandle<T>)
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let slot = Arc::new(ResultSlot::new());
    let out = slot.clone();
    let wrapped = async move {
        if context::cancelled() {
            return Outcome::Cancelled;
        }
        match future.await {
            Ok(value) => {
                out.set(value);
                Outcome::Completed
            }
            Err(Error::Cancelled) => Outcome::Cancelled,
            Err(err) => Outcome::Failed(err),
        }
    };

    let raw = RawTask::new(
        shared.next_task_id(),
        context::current_task_id(),
        scope,
        Box::pin(wrapped),
        spawned_at,
    );
    let handle = TaskHandle {
        raw: raw.clone(),
        result: slot,
    };
    (raw, handle)
}

/// Give up the carrier once so other runnable tasks get a turn.
pub async fn yield_now() {
    YieldNow { yielded: false }.await
}

struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::runtime::Runtime;
    use crate::time::sleep;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn spawn_and_join_blocking() {
        let rt = Runtime::with_carriers(2).unwrap();
        let h = rt.spawn(async { Ok(42) });
        assert_eq!(h.join_blocking().unwrap(), 42);
    }

    #[test]
    fn join_from_task() {
        let rt = Runtime::with_carriers(2).unwrap();
        let handle = rt.handle();
        let total = rt
            .block_on(async move {
                let a = handle.spawn(async { Ok(20) });
                let b = handle.spawn(async { Ok(22) });
                Ok::<_, Error>(a.join().await? + b.join().await?)
            })
            .unwrap();
        assert_eq!(total, 42);
    }

    #[test]
    fn panic_becomes_failure() {
        let rt = Runtime::with_carriers(1).unwrap();
        let h = rt.spawn(async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        match h.join_blocking() {
            Err(Error::TaskFailed { cause, .. }) => {
                assert!(matches!(&*cause, Error::Failed(m) if m.contains("boom")))
            }
            other => panic!("expected TaskFailed, got {:?}", other),
        }
    }

    #[test]
    fn cancel_interrupts_sleep() {
        let rt = Runtime::with_carriers(1).unwrap();
        let h = rt.spawn(async {
            sleep(Duration::from_secs(30)).await?;
            Ok::<_, Error>(())
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(h.cancel());
        let err = h.join_blocking().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn try_result_before_and_after() {
        let rt = Runtime::with_carriers(1).unwrap();
        let h = rt.spawn(async {
            sleep(Duration::from_millis(50)).await?;
            Ok::<_, Error>("done")
        });
        assert!(matches!(h.try_result(), Err(Error::NotFinished { .. })));
        std::thread::sleep(Duration::from_millis(200));
        assert!(h.is_finished());
        assert_eq!(h.try_result().unwrap(), "done");
    }

    #[test]
    fn join_timeout_leaves_task_running() {
        let rt = Runtime::with_carriers(2).unwrap();
        let handle = rt.handle();
        let value = rt
            .block_on(async move {
                let slow = handle.spawn(async {
                    sleep(Duration::from_millis(100)).await?;
                    Ok::<_, Error>(7)
                });
                let err = slow.join_timeout(Duration::from_millis(10)).await.unwrap_err();
                assert!(err.is_timeout());
                slow.join().await
            })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn join_all_in_order() {
        let rt = Runtime::with_carriers(4).unwrap();
        let handle = rt.handle();
        let counter = Arc::new(AtomicI32::new(0));
        let c = counter.clone();
        let results = rt
            .block_on(async move {
                let handles = (0..50)
                    .map(|i| {
                        let c = c.clone();
                        handle.spawn(async move {
                            c.fetch_add(1, Ordering::Relaxed);
                            yield_now().await;
                            Ok(i)
                        })
                    })
                    .collect();
                Ok::<_, Error>(join_all(handles).await)
            })
            .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 50);
        let values: Vec<i32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..50).collect::<Vec<_>>());
    }
}
