// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Lock contention with a runtime dump taken mid-run.
//!
//! Writers swap a shared counter under one lock and spin on the old one.
//! The plain lock parks waiting writers; the monitor pins them, which the
//! dump shows as pinned carriers with a runnable backlog.

use std::hint::black_box;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use skein_rt::sync::Mutex;
use skein_rt::{yield_now, Error, Policy};

use super::{die, runtime_config, start_runtime, Flags};
use crate::output;

struct Counter {
    value: u64,
}

pub fn cmd_contention(args: &[String]) {
    let flags = Flags::new(args);
    let synchronized = flags.has("--synchronized");
    let json = flags.has("--json");
    let writers: usize = flags.value("--writers", 40);
    let millis: u64 = flags.value("--millis", 1000);
    let work: u64 = flags.value("--work", 100_000);

    let rt = start_runtime(runtime_config(&flags, 4));
    let lock = Arc::new(Mutex::new(Counter { value: 1 }));
    let stop = Arc::new(AtomicBool::new(false));
    let sections = Arc::new(AtomicU64::new(0));

    let scope = rt.open_scope("writers", Policy::ShutdownOnFailure);
    for _ in 0..writers {
        let (lock, stop, sections) = (lock.clone(), stop.clone(), sections.clone());
        let forked = scope.fork(async move {
            while !stop.load(Ordering::Relaxed) {
                let swap = |c: &mut Counter| {
                    let old = std::mem::replace(c, Counter { value: 1 });
                    consume_cpu(old, work);
                };
                if synchronized {
                    lock.synchronized(swap).await?;
                } else {
                    lock.lock(swap).await?;
                }
                sections.fetch_add(1, Ordering::Relaxed);
                yield_now().await;
            }
            Ok::<_, Error>(())
        });
        if let Err(e) = forked {
            die(e);
        }
    }

    let run_for = Duration::from_millis(millis);
    let start = Instant::now();
    thread::sleep(run_for / 2);
    let snap = rt.snapshot();
    thread::sleep(run_for.saturating_sub(start.elapsed()));
    stop.store(true, Ordering::Relaxed);

    if let Err(e) = scope.join_blocking().and_then(|_| scope.close()) {
        die(e);
    }
    let elapsed = start.elapsed();
    let total = sections.load(Ordering::Relaxed);

    if json {
        match serde_json::to_string_pretty(&snap) {
            Ok(text) => println!("{}", text),
            Err(e) => die(e),
        }
    } else {
        println!("{}", output::banner("runtime dump"));
        print!("{}", snap);
        println!("{}", output::separator(40));
        output::log(&format!(
            "{} writers ({}) ran {} critical sections in {} ms ({:.0}/s)",
            writers,
            if synchronized { "monitor" } else { "lock" },
            total,
            output::millis(elapsed),
            total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        ));
    }
    drop(scope);
    rt.shutdown();
}

fn consume_cpu(mut counter: Counter, work: u64) {
    while counter.value < work {
        counter.value = black_box(counter.value + 1);
    }
}
