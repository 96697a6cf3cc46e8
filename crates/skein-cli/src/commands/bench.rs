// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Start/finish latch benchmark: lightweight tasks against OS threads.

use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use skein_rt::sync::Latch;
use skein_rt::{Error, Result, Runtime};

use super::{die, runtime_config, start_runtime, Flags};
use crate::output;

/// Bytes allocated and dropped by the `gc` variant.
const CHURN_BYTES: usize = 256 << 20;
const CHURN_CHUNK: usize = 10_000;

static DUMMY: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Lightweight,
    Native,
}

struct Round {
    started: Arc<Latch>,
    go: Arc<Latch>,
    done: Arc<Latch>,
}

impl Round {
    fn new(count: usize) -> Self {
        Self {
            started: Arc::new(Latch::new(count)),
            go: Arc::new(Latch::new(1)),
            done: Arc::new(Latch::new(count)),
        }
    }
}

pub fn cmd_bench(args: &[String]) {
    let mode = match args[0].as_str() {
        "lightweight" | "vthreads" => Mode::Lightweight,
        "native" | "pthreads" => Mode::Native,
        other => die(format!("unknown mode `{}` (expected lightweight or native)", other)),
    };
    let churn = match args[1].as_str() {
        "gc" => true,
        "nogc" => false,
        other => die(format!("unknown gc setting `{}` (expected gc or nogc)", other)),
    };
    let count: usize = args[2]
        .parse()
        .unwrap_or_else(|e| die(format!("bad count `{}`: {}", args[2], e)));
    let flags = Flags::new(&args[3..]);
    let rounds: usize = flags.value("--rounds", 10);
    let frames: usize = flags.value("--frames", 100);

    let result = match mode {
        Mode::Lightweight => {
            let default = thread::available_parallelism().map_or(4, |n| n.get());
            let rt = start_runtime(runtime_config(&flags, default));
            run_lightweight(rt, count, rounds, frames, churn)
        }
        Mode::Native => run_native(count, rounds, frames, churn),
    };
    if let Err(e) = result {
        die(e);
    }
}

fn run_lightweight(rt: Runtime, count: usize, rounds: usize, frames: usize, churn: bool) -> Result<()> {
    for _ in 0..rounds {
        let round = Round::new(count);
        let start = Instant::now();
        for _ in 0..count {
            let (started, go, done) = (round.started.clone(), round.go.clone(), round.done.clone());
            // Handles are dropped; the done latch is the join.
            rt.spawn(async move {
                started.count_down();
                walk_frames(frames);
                go.wait().await?;
                done.count_down();
                Ok::<_, Error>(())
            });
        }
        finish_round(&round, start, churn)?;
    }

    let start = Instant::now();
    rt.shutdown();
    output::log(&format!("Shutdown in {} ms", output::millis(start.elapsed())));
    Ok(())
}

type Job = Box<dyn FnOnce() + Send>;

/// Fixed pool with one OS thread per task, reused across rounds.
fn run_native(count: usize, rounds: usize, frames: usize, churn: bool) -> Result<()> {
    let (tx, rx) = mpsc::channel::<Job>();
    let rx = Arc::new(Mutex::new(rx));
    let mut workers = Vec::with_capacity(count);
    for i in 0..count {
        let rx = rx.clone();
        let worker = thread::Builder::new()
            .name(format!("native-{}", i))
            .spawn(move || loop {
                let job = rx.lock().recv();
                match job {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            })
            .map_err(|e| Error::Spawn(e.to_string()))?;
        workers.push(worker);
    }

    for _ in 0..rounds {
        let round = Round::new(count);
        let start = Instant::now();
        for _ in 0..count {
            let (started, go, done) = (round.started.clone(), round.go.clone(), round.done.clone());
            let job: Job = Box::new(move || {
                started.count_down();
                walk_frames(frames);
                if go.wait_blocking().is_ok() {
                    done.count_down();
                }
            });
            if tx.send(job).is_err() {
                return Err(Error::failed("native worker pool is gone"));
            }
        }
        finish_round(&round, start, churn)?;
    }

    let start = Instant::now();
    drop(tx);
    for worker in workers {
        let _ = worker.join();
    }
    output::log(&format!("Shutdown in {} ms", output::millis(start.elapsed())));
    Ok(())
}

fn finish_round(round: &Round, start: Instant, churn: bool) -> Result<()> {
    round.started.wait_blocking()?;
    output::log(&format!("All threads started in {} ms", output::millis(start.elapsed())));

    if churn {
        churn_allocator();
    }

    let start = Instant::now();
    round.go.count_down();
    round.done.wait_blocking()?;
    output::log(&format!("All threads finished in {} ms", output::millis(start.elapsed())));
    Ok(())
}

/// Stand-in for a deep call stack: a fixed number of iterations that the
/// optimizer cannot drop.
fn walk_frames(frames: usize) {
    for depth in (0..=frames).rev() {
        DUMMY.fetch_add(black_box(depth as u64) & 1, Ordering::Relaxed);
    }
}

fn churn_allocator() {
    let mut remaining = CHURN_BYTES;
    while remaining > 0 {
        black_box(vec![0u8; CHURN_CHUNK]);
        remaining = remaining.saturating_sub(CHURN_CHUNK);
    }
}
