// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Request handlers blocked on a slow one-time initialization.
//!
//! The database init sleeps cooperatively, so it needs a free carrier to
//! finish. The endpoint init waits for the database, and every handler
//! waits for the endpoint. With pinned init waits the handlers hold all
//! carriers and the database init never resumes.

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use skein_rt::sync::Semaphore;
use skein_rt::time::sleep;
use skein_rt::{Error, Handle, InitState, Resource, Result, TaskHandle};

use super::{die, runtime_config, start_runtime, Flags};
use crate::output;

const DB_KEY: &str = "db";
const ENDPOINT_KEY: &str = "endpoint";
const QUERY_TIME: Duration = Duration::from_millis(100);

struct DbConnection {
    name: String,
}

impl DbConnection {
    async fn query(&self, _sql: &str) -> Result<&'static str> {
        sleep(QUERY_TIME).await?;
        Ok("R")
    }
}

struct ServiceEndpoint;

pub fn cmd_clinit(args: &[String]) {
    let flags = Flags::new(args);
    let pinned = flags.has("--pinned");
    let requests: usize = flags.value("--requests", 100);
    let rounds: usize = flags.value("--rounds", 3);
    let init_time = Duration::from_millis(flags.value("--init-ms", 2000));
    let timeout = Duration::from_millis(flags.value("--timeout-ms", 10_000));
    if requests == 0 {
        die("--requests must be at least 1");
    }

    let config = runtime_config(&flags, 4).pin(Resource::InitWait, pinned);
    let recheck = config.init_recheck_interval;
    let rt = start_runtime(config);
    output::log(&format!(
        "{} carriers, init waits {}",
        rt.handle().carriers(),
        if pinned { "pinned" } else { "cooperative" }
    ));

    let h = rt.handle();
    let init = rt.spawn(async move {
        h.init_registry()
            .run_once(DB_KEY, || initialize_db("database", init_time))
            .await?;
        Ok::<_, Error>(())
    });

    let slots = Arc::new(Semaphore::new(requests));
    let deadline = Instant::now() + timeout;
    let start = Instant::now();
    let total = requests * rounds;
    let mut handlers: Vec<TaskHandle<()>> = Vec::with_capacity(total);
    let mut stuck = false;

    for _ in 0..total {
        if !acquire_slot(&slots, deadline) {
            stuck = true;
            break;
        }
        let h = rt.handle();
        let slots = slots.clone();
        handlers.push(rt.spawn(async move {
            let result = handle_request(&h, recheck).await;
            slots.release(1);
            result
        }));
    }
    if !stuck {
        stuck = !wait_finished(&handlers, deadline);
    }

    if stuck {
        println!();
        let snap = rt.snapshot();
        output::log(&format!(
            "no progress after {} ms, `{}` is {}",
            output::millis(timeout),
            DB_KEY,
            describe(&rt.init_registry().state(DB_KEY))
        ));
        print!("{}", snap);
        println!(
            "{} {} of {} handlers finished",
            output::status_fail(),
            handlers.iter().filter(|t| t.is_finished()).count(),
            total
        );
        for task in handlers.iter().chain(std::iter::once(&init)) {
            task.cancel();
        }
        let pinned_now = snap.pinned;
        let carriers = snap.carriers.len();
        rt.shutdown_timeout(Duration::from_secs(1));
        die(format!(
            "requests stalled with {} of {} carriers pinned",
            pinned_now, carriers
        ));
    }

    let failed = handlers
        .into_iter()
        .filter_map(|t| t.try_result().err())
        .collect::<Vec<_>>();
    println!();
    let _ = std::io::stdout().flush();
    if let Err(e) = init.join_blocking() {
        die(e);
    }
    if let Some(first) = failed.first() {
        die(format!("{} request(s) failed, first: {}", failed.len(), first));
    }
    output::log(&format!(
        "Handled {} requests in {} ms",
        total,
        output::millis(start.elapsed())
    ));
    for d in rt.gate().diagnostics() {
        println!("{}: {}", output::warning_label(), d);
    }
    rt.shutdown();
}

async fn initialize_db(name: &str, init_time: Duration) -> Result<DbConnection> {
    output::log(&format!("Initializing DBConnection to {}.", name));
    sleep(init_time).await?;
    Ok(DbConnection {
        name: name.to_string(),
    })
}

/// The endpoint can only be built once the database is up.
async fn initialize_endpoint(h: &Handle, recheck: Duration) -> Result<ServiceEndpoint> {
    loop {
        match h
            .init_registry()
            .await_ready::<DbConnection>(DB_KEY, Some(recheck))
            .await
        {
            Ok(db) => {
                output::log(&format!("DBConnection to {} is READY!", db.name));
                return Ok(ServiceEndpoint);
            }
            Err(e) if e.is_timeout() => output::log("Waiting for DBConnection."),
            Err(e) => return Err(e),
        }
    }
}

async fn handle_request(h: &Handle, recheck: Duration) -> Result<()> {
    let reg = h.init_registry();
    reg.run_once::<ServiceEndpoint, _, _>(ENDPOINT_KEY, || initialize_endpoint(h, recheck))
        .await?;
    let db = reg.await_ready::<DbConnection>(DB_KEY, None).await?;
    let data = db.query("SELECT * FROM table").await?;
    print!("{}", data);
    Ok(())
}

fn acquire_slot(slots: &Semaphore, deadline: Instant) -> bool {
    loop {
        if let Some(permit) = slots.try_acquire() {
            permit.forget();
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn wait_finished(handlers: &[TaskHandle<()>], deadline: Instant) -> bool {
    while !handlers.iter().all(|t| t.is_finished()) {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

fn describe(state: &InitState) -> String {
    match state {
        InitState::Uninitialized => "uninitialized".to_string(),
        InitState::Initializing(owner) => format!("being initialized by {}", owner),
        InitState::Ready => "ready".to_string(),
        InitState::Failed(e) => format!("failed: {}", e),
    }
}
