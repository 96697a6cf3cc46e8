// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! skein runtime library.
//!
//! Lightweight tasks multiplexed onto a fixed pool of carrier threads,
//! with a gate that tells cooperative waits from carrier-pinning ones,
//! structured scopes and one-time initialization guards.
//!
//! Components:
//! - `green`: tasks, run queues, carriers, scheduler, task handles
//! - `gate`: blocking-region leases, pin flags, deadlock-risk diagnostics
//! - `scope`: structured fork/join/close
//! - `init`: run-once registry
//! - `sync`: latch, semaphore, mutex
//! - `time`: timer thread, sleep, timeout
//! - `runtime`: construction, spawn, block_on, shutdown
//! - `snapshot`: runtime dump

pub mod cancel;
pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod green;
pub mod init;
pub mod runtime;
pub mod scope;
pub mod snapshot;
pub mod sync;
pub mod time;

pub use config::{InitFailurePolicy, InterruptPolicy, RuntimeConfig};
pub use error::{Error, Result, Violation};
pub use gate::{Gate, Lease, Resource};
pub use green::handle::{join_all, yield_now, TaskHandle};
pub use green::task::{TaskId, TaskState};
pub use init::{InitRegistry, InitState};
pub use runtime::{Handle, Runtime};
pub use scope::{JoinReport, Phase, Policy, Scope, ScopeId, ScopeRef};
pub use snapshot::RuntimeSnapshot;
