// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative synchronization primitives.
//!
//! Every wait enters the gate first. A cooperative lease parks the task on
//! a waker list; a pinning lease (or a caller outside any runtime) blocks
//! the OS thread on the primitive's condvar instead.

mod latch;
mod mutex;
mod semaphore;

pub use latch::Latch;
pub use mutex::Mutex;
pub use semaphore::{OwnedPermit, Permit, Semaphore};

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use parking_lot::Condvar;

use crate::cancel::observe_interrupt;
use crate::error::Result;
use crate::gate::{self, Resource};
use crate::green::waiters::Waiters;
use crate::time::Delay;

/// Primitive state that carries its own waker list.
trait Waitable {
    fn waiters(&mut self) -> &mut Waiters;
}

/// Wait until `ready` returns true for the state behind `state`.
///
/// `ready` may also claim what it found (take a permit). `Ok(false)` means
/// the deadline passed.
async fn wait_on<S, R>(
    resource: Resource,
    state: &parking_lot::Mutex<S>,
    cvar: &Condvar,
    deadline: Option<Instant>,
    mut ready: R,
) -> Result<bool>
where
    S: Waitable,
    R: FnMut(&mut S) -> bool,
{
    let lease = gate::enter(resource);
    if lease.blocks_thread() {
        return gate::block_until(state, cvar, deadline, ready);
    }
    WaitFor {
        state,
        ready: &mut ready,
        key: None,
        ignored: false,
        delay: deadline.map(Delay::until),
    }
    .await
}

struct WaitFor<'a, S: Waitable, R> {
    state: &'a parking_lot::Mutex<S>,
    ready: &'a mut R,
    key: Option<u64>,
    ignored: bool,
    delay: Option<Delay>,
}

impl<S, R> Future for WaitFor<'_, S, R>
where
    S: Waitable,
    R: FnMut(&mut S) -> bool,
{
    type Output = Result<bool>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<bool>> {
        let this = &mut *self;
        observe_interrupt(&mut this.ignored)?;
        {
            let mut st = this.state.lock();
            if (this.ready)(&mut *st) {
                st.waiters().remove(&mut this.key);
                return Poll::Ready(Ok(true));
            }
            st.waiters().register(&mut this.key, cx.waker());
        }
        if let Some(delay) = this.delay.as_mut() {
            if Pin::new(delay).poll(cx).is_ready() {
                return Poll::Ready(Ok(false));
            }
        }
        Poll::Pending
    }
}

impl<S: Waitable, R> Drop for WaitFor<'_, S, R> {
    fn drop(&mut self) {
        if self.key.is_some() {
            self.state.lock().waiters().remove(&mut self.key);
        }
    }
}
