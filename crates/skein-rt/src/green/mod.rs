// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Lightweight tasks on a fixed pool of carrier threads.
//!
//! Stackless tasks (boxed futures) on a work-stealing M:N scheduler.
//! Components:
//! - `task`:      task header, state machine, waker
//! - `queue`:     local queues + global injector
//! - `carrier`:   per-carrier binding and pinned flag
//! - `waiters`:   waker lists used by every cooperative wait
//! - `scheduler`: carrier threads + main polling loop
//! - `handle`:    TaskHandle (join/cancel/result) and spawning

pub mod carrier;
pub mod handle;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod waiters;
