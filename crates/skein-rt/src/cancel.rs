// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation.
//!
//! Each task carries a token. Cancelling sets the flag and wakes the task;
//! the task notices at its next suspension point or when it checks
//! `context::cancelled()`.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::config::InterruptPolicy;
use crate::context;
use crate::error::{Error, Result};

/// Cancellation flag owned by one task.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns true if this call did the cancelling.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Called by every cooperative wait on each poll.
///
/// Under `Propagate` a cancelled task gets `Error::Cancelled`. Under
/// `Ignore` the interrupt is logged once per wait and the wait goes on.
pub(crate) fn observe_interrupt(ignored: &mut bool) -> Result<()> {
    if !context::cancelled() {
        return Ok(());
    }
    let policy = context::current_shared()
        .map(|shared| shared.config.interrupt_policy)
        .unwrap_or_default();
    match policy {
        InterruptPolicy::Propagate => Err(Error::Cancelled),
        InterruptPolicy::Ignore => {
            if !*ignored {
                *ignored = true;
                debug!(task = ?context::current_task_id(), "interrupt ignored while waiting");
            }
            Ok(())
        }
    }
}
