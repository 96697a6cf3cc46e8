// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Waker list shared by every cooperative wait primitive.
//!
//! Lives inside the primitive's own mutex so that "check condition, then
//! register" and "change condition, then take wakers" cannot interleave.
//! Waking drains the list; a waiter that is still pending re-registers on
//! its next poll.

use std::collections::HashMap;
use std::task::Waker;

#[derive(Default)]
pub(crate) struct Waiters {
    next_key: u64,
    slots: HashMap<u64, Waker>,
}

impl Waiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or refresh) the waker stored under `key`.
    pub fn register(&mut self, key: &mut Option<u64>, waker: &Waker) {
        let k = *key.get_or_insert_with(|| {
            self.next_key += 1;
            self.next_key
        });
        match self.slots.get_mut(&k) {
            Some(existing) if existing.will_wake(waker) => {}
            Some(existing) => *existing = waker.clone(),
            None => {
                self.slots.insert(k, waker.clone());
            }
        }
    }

    /// Forget the waiter under `key` (drop of a pending future).
    pub fn remove(&mut self, key: &mut Option<u64>) {
        if let Some(k) = key.take() {
            self.slots.remove(&k);
        }
    }

    /// Take every registered waker. Call `wake_all` after releasing the lock.
    pub fn take_all(&mut self) -> Vec<Waker> {
        self.slots.drain().map(|(_, w)| w).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub(crate) fn wake_all(wakers: Vec<Waker>) {
    for waker in wakers {
        waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn register_is_idempotent_per_key() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut waiters = Waiters::new();
        let mut key = None;
        waiters.register(&mut key, &waker);
        waiters.register(&mut key, &waker);
        assert_eq!(waiters.len(), 1);

        wake_all(waiters.take_all());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(waiters.is_empty());
    }

    #[test]
    fn removed_waiter_is_not_woken() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut waiters = Waiters::new();
        let mut a = None;
        let mut b = None;
        waiters.register(&mut a, &waker);
        waiters.register(&mut b, &waker);
        waiters.remove(&mut a);
        assert!(a.is_none());

        wake_all(waiters.take_all());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
