// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime errors.
//!
//! Structural errors (illegal close/fork, closed scope) go straight back to
//! the caller. Task errors are captured in the task's outcome and only show
//! up when a handle is joined or a scope join aggregates them.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::context::Owner;
use crate::gate::Resource;
use crate::green::task::TaskId;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a scope operation broke the structure rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    /// Only the owner may join or close a scope.
    #[error("{caller} does not own scope `{scope}` (owner is {owner})")]
    WrongOwner {
        scope: String,
        owner: Owner,
        caller: Owner,
    },

    /// Forking requires the owner or a task inside the scope's subtree.
    #[error("{caller} is not running inside scope `{scope}` or one of its descendants")]
    NotInScope { scope: String, caller: Owner },

    /// Tasks are still running, or were forked after the last join.
    #[error("scope `{scope}` has {live} live task(s) and {unjoined} fork(s) not yet joined")]
    UnjoinedTasks {
        scope: String,
        live: usize,
        unjoined: usize,
    },

    /// Nested scopes must close before their parent.
    #[error("scope `{scope}` still has {count} open child scope(s)")]
    OpenChildScopes { scope: String, count: usize },

    /// The initializer for `key` tried to wait on its own initialization.
    #[error("recursive initialization of `{key}`")]
    RecursiveInit { key: String },

    /// A task returned `Pending` while holding a pinning lease.
    #[error("task suspended while pinned on {resource}")]
    SuspendedWhilePinned { resource: Resource },

    /// The operation needs a runtime and the caller is not on one.
    #[error("`{op}` called outside a runtime")]
    NotInRuntime { op: &'static str },
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("structure violation: {0}")]
    StructureViolation(#[from] Violation),

    #[error("scope `{scope}` is closed")]
    ScopeClosed { scope: String },

    /// A task's error, surfaced through its handle or its scope's join.
    #[error("{task} failed: {cause}")]
    TaskFailed {
        task: TaskId,
        #[source]
        cause: Arc<Error>,
    },

    /// Application-level failure raised inside a task (panics land here too).
    #[error("{0}")]
    Failed(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    TimeoutExceeded(Duration),

    /// Diagnostic only. Recorded by the gate, never returned from a wait.
    #[error("deadlock risk: {pinned} of {carriers} carriers pinned with {runnable} runnable task(s) queued")]
    DeadlockRisk {
        pinned: usize,
        carriers: usize,
        runnable: usize,
    },

    #[error("{} task(s) failed", .0.len())]
    Aggregate(Vec<Error>),

    #[error("{task} has not finished")]
    NotFinished { task: TaskId },

    #[error("init key `{key}` holds a value of a different type")]
    InitTypeMismatch { key: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to start runtime thread: {0}")]
    Spawn(String),
}

impl Error {
    /// Build an application failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        Error::Failed(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Error::Cancelled)
    }

    pub fn is_structure_violation(&self) -> bool {
        matches!(self, Error::StructureViolation(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimeoutExceeded(_))
    }

    /// Strip `TaskFailed` wrappers down to the error the task produced.
    pub fn root_cause(&self) -> &Error {
        let mut err = self;
        while let Error::TaskFailed { cause, .. } = err {
            err = cause;
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_unwraps_nested_failures() {
        let inner = Error::failed("disk full");
        let outer = Error::TaskFailed {
            task: TaskId(2),
            cause: Arc::new(Error::TaskFailed {
                task: TaskId(1),
                cause: Arc::new(inner),
            }),
        };
        assert!(matches!(outer.root_cause(), Error::Failed(m) if m == "disk full"));
        assert_eq!(outer.to_string(), "task-2 failed: task-1 failed: disk full");
    }

    #[test]
    fn cancelled_through_wrapper() {
        let err = Error::TaskFailed {
            task: TaskId(7),
            cause: Arc::new(Error::Cancelled),
        };
        assert!(err.is_cancelled());
        assert!(!err.is_structure_violation());
    }

    #[test]
    fn violation_converts() {
        let err: Error = Violation::OpenChildScopes {
            scope: "parent".into(),
            count: 1,
        }
        .into();
        assert!(err.is_structure_violation());
        assert!(err.to_string().contains("open child scope"));
    }
}
