// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Mutex with closure-based access.
//!
//! No guard objects escape: the value is only reachable inside the closure.
//! `lock` waits cooperatively (`Resource::Lock`); `synchronized` waits as an
//! intrinsic monitor (`Resource::Monitor`), which pins its carrier unless
//! the gate is told otherwise.

use super::Semaphore;
use crate::error::Result;
use crate::gate::Resource;

pub struct Mutex<T> {
    access: Semaphore,
    value: parking_lot::Mutex<T>,
}

/// Returns the access permit when the closure finishes or unwinds.
struct Release<'a>(&'a Semaphore);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.release(1);
    }
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            access: Semaphore::new(1),
            value: parking_lot::Mutex::new(value),
        }
    }

    /// Acquire the lock and run `f` with exclusive access.
    pub async fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.access.acquire_as(Resource::Lock).await?;
        Ok(self.with_value(f))
    }

    /// Monitor-style access. Waits pin the carrier by default.
    pub async fn synchronized<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.access.acquire_as(Resource::Monitor).await?;
        Ok(self.with_value(f))
    }

    /// Blocking access for plain threads. On a carrier this pins it.
    pub fn lock_blocking<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.access.acquire_blocking_as(Resource::Lock)?;
        Ok(self.with_value(f))
    }

    /// Run `f` only if the lock is free right now.
    pub fn try_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.access
            .try_acquire_raw()
            .then(|| self.with_value(f))
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    fn with_value<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _release = Release(&self.access);
        let mut value = self.value.lock();
        f(&mut value)
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
