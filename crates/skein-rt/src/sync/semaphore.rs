// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Counting semaphore with RAII permits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{wait_on, Waitable};
use crate::error::{Error, Result};
use crate::gate::{self, Resource};
use crate::green::waiters::{wake_all, Waiters};

struct SemState {
    permits: usize,
    waiters: Waiters,
}

impl Waitable for SemState {
    fn waiters(&mut self) -> &mut Waiters {
        &mut self.waiters
    }
}

fn take_permit(st: &mut SemState) -> bool {
    if st.permits > 0 {
        st.permits -= 1;
        true
    } else {
        false
    }
}

pub struct Semaphore {
    state: Mutex<SemState>,
    cvar: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SemState {
                permits,
                waiters: Waiters::new(),
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn available(&self) -> usize {
        self.state.lock().permits
    }

    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        take_permit(&mut self.state.lock()).then(|| Permit { sem: self })
    }

    pub async fn acquire(&self) -> Result<Permit<'_>> {
        self.acquire_as(Resource::Semaphore).await?;
        Ok(Permit { sem: self })
    }

    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Permit<'_>> {
        let deadline = Instant::now() + timeout;
        if !wait_on(Resource::Semaphore, &self.state, &self.cvar, Some(deadline), take_permit).await? {
            return Err(Error::TimeoutExceeded(timeout));
        }
        Ok(Permit { sem: self })
    }

    /// Acquire a permit that is not tied to a borrow of the semaphore.
    pub async fn acquire_owned(self: &Arc<Self>) -> Result<OwnedPermit> {
        self.acquire_as(Resource::Semaphore).await?;
        Ok(OwnedPermit { sem: self.clone() })
    }

    /// Block the calling thread. On a carrier this pins it.
    pub fn acquire_blocking(&self) -> Result<Permit<'_>> {
        self.acquire_blocking_as(Resource::Semaphore)?;
        Ok(Permit { sem: self })
    }

    /// Return `n` permits and wake waiters.
    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let wakers = {
            let mut st = self.state.lock();
            st.permits += n;
            st.waiters.take_all()
        };
        self.cvar.notify_all();
        wake_all(wakers);
    }

    pub fn add_permits(&self, n: usize) {
        self.release(n);
    }

    /// Take one raw permit, waiting as `resource`. The caller releases it.
    pub(crate) async fn acquire_as(&self, resource: Resource) -> Result<()> {
        wait_on(resource, &self.state, &self.cvar, None, take_permit).await?;
        Ok(())
    }

    pub(crate) fn acquire_blocking_as(&self, resource: Resource) -> Result<()> {
        let _lease = gate::enter_pinned(resource);
        gate::block_until(&self.state, &self.cvar, None, take_permit)?;
        Ok(())
    }

    pub(crate) fn try_acquire_raw(&self) -> bool {
        take_permit(&mut self.state.lock())
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available())
            .finish()
    }
}

/// Releases one permit on drop.
pub struct Permit<'a> {
    sem: &'a Semaphore,
}

impl Permit<'_> {
    /// Keep the permit taken after this value is gone.
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.sem.release(1);
    }
}

/// `Arc`-backed permit that can move into another task.
pub struct OwnedPermit {
    sem: Arc<Semaphore>,
}

impl Drop for OwnedPermit {
    fn drop(&mut self) {
        self.sem.release(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::time::sleep;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn permits_are_raii() {
        let sem = Semaphore::new(2);
        let a = sem.try_acquire().unwrap();
        let _b = sem.try_acquire().unwrap();
        assert!(sem.try_acquire().is_none());
        drop(a);
        assert_eq!(sem.available(), 1);
        sem.add_permits(2);
        assert_eq!(sem.available(), 3);
    }

    #[test]
    fn bounds_concurrency() {
        let rt = Runtime::with_carriers(4).unwrap();
        let sem = Arc::new(Semaphore::new(2));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let sem = sem.clone();
                let inside = inside.clone();
                let peak = peak.clone();
                rt.spawn(async move {
                    let _permit = sem.acquire_owned().await?;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(2)).await?;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Error>(())
                })
            })
            .collect();
        for h in handles {
            h.join_blocking().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn acquire_timeout_expires() {
        let rt = Runtime::with_carriers(1).unwrap();
        let err = rt
            .block_on(async {
                let sem = Semaphore::new(0);
                sem.acquire_timeout(Duration::from_millis(10)).await.map(|_| ())
            })
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
