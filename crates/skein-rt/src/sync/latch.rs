// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Count-down latch.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{wait_on, Waitable};
use crate::error::Result;
use crate::gate::{self, Resource};
use crate::green::waiters::{wake_all, Waiters};

struct LatchState {
    count: usize,
    waiters: Waiters,
}

impl Waitable for LatchState {
    fn waiters(&mut self) -> &mut Waiters {
        &mut self.waiters
    }
}

/// Opens once `count_down` has been called `count` times.
pub struct Latch {
    state: Mutex<LatchState>,
    cvar: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(LatchState {
                count,
                waiters: Waiters::new(),
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Decrement the count, releasing every waiter when it reaches zero.
    /// Extra calls after zero do nothing.
    pub fn count_down(&self) {
        let wakers = {
            let mut st = self.state.lock();
            if st.count == 0 {
                return;
            }
            st.count -= 1;
            if st.count > 0 {
                return;
            }
            st.waiters.take_all()
        };
        self.cvar.notify_all();
        wake_all(wakers);
    }

    pub async fn wait(&self) -> Result<()> {
        wait_on(Resource::Latch, &self.state, &self.cvar, None, |st| st.count == 0).await?;
        Ok(())
    }

    /// `Ok(false)` if the latch was still closed after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        wait_on(Resource::Latch, &self.state, &self.cvar, Some(deadline), |st| {
            st.count == 0
        })
        .await
    }

    /// Block the calling thread. On a carrier this pins it.
    pub fn wait_blocking(&self) -> Result<()> {
        let _lease = gate::enter_pinned(Resource::Latch);
        gate::block_until(&self.state, &self.cvar, None, |st| st.count == 0)?;
        Ok(())
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("count", &self.count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runtime::Runtime;
    use std::sync::Arc;

    #[test]
    fn opens_at_zero() {
        let latch = Latch::new(2);
        latch.count_down();
        assert_eq!(latch.count(), 1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
        latch.wait_blocking().unwrap();
    }

    #[test]
    fn plain_thread_waits_for_tasks() {
        let rt = Runtime::with_carriers(2).unwrap();
        let latch = Arc::new(Latch::new(10));
        for _ in 0..10 {
            let latch = latch.clone();
            rt.spawn(async move {
                latch.count_down();
                Ok(())
            });
        }
        latch.wait_blocking().unwrap();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn waiting_tasks_do_not_hold_carriers() {
        // More waiters than carriers: only works if waiters park.
        let rt = Runtime::with_carriers(2).unwrap();
        let gate = Arc::new(Latch::new(1));
        let done = Arc::new(Latch::new(8));
        for _ in 0..8 {
            let gate = gate.clone();
            let done = done.clone();
            rt.spawn(async move {
                gate.wait().await?;
                done.count_down();
                Ok::<_, Error>(())
            });
        }
        std::thread::sleep(Duration::from_millis(20));
        rt.spawn({
            let gate = gate.clone();
            async move {
                gate.count_down();
                Ok(())
            }
        });
        done.wait_blocking().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let rt = Runtime::with_carriers(1).unwrap();
        let opened = rt
            .block_on(async {
                let latch = Latch::new(1);
                latch.wait_timeout(Duration::from_millis(20)).await
            })
            .unwrap();
        assert!(!opened);
    }
}
