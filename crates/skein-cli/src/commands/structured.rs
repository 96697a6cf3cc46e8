// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scope ownership cases.
//!
//! A parent scope with two tasks, each of which opens a child scope, forks
//! one task into the child and one into the parent, then joins the child.
//! The cases differ in who tries to close the parent and when.

use std::time::Duration;

use skein_rt::time::sleep;
use skein_rt::{Error, Handle, Policy, Result, ScopeRef};

use super::{die, runtime_config, start_runtime, Flags};
use crate::output;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Case {
    ForkFromParent,
    CloseParentInChild,
    CloseWithOpenChild,
}

pub fn cmd_structured(args: &[String]) {
    let case = match args[0].as_str() {
        "fork-from-parent" => Case::ForkFromParent,
        "close-parent-in-child" => Case::CloseParentInChild,
        "close-with-open-child" => Case::CloseWithOpenChild,
        other => die(format!("unknown case `{}`", other)),
    };
    let flags = Flags::new(&args[1..]);
    let unit = Duration::from_millis(flags.value("--unit-ms", 1000));

    let rt = start_runtime(runtime_config(&flags, 4));
    let h = rt.handle();
    let result = rt.block_on(async move {
        match case {
            Case::ForkFromParent => two_children(&h, unit, false).await,
            Case::CloseParentInChild => two_children(&h, unit, true).await,
            Case::CloseWithOpenChild => close_from_owner(&h, unit).await,
        }
    });
    if let Err(e) = result {
        die(e);
    }
    println!("{} every scope closed", output::status_pass());
    rt.shutdown();
}

/// Two tasks in the parent scope each run `compute_with`.
async fn two_children(h: &Handle, unit: Duration, close_parent: bool) -> Result<()> {
    let parent = h.open_scope("ParentScope", Policy::ShutdownOnFailure);
    let mut tasks = Vec::new();
    for _ in 0..2 {
        let (h, scope) = (h.clone(), parent.share());
        tasks.push(parent.fork(async move { Ok(compute_with(&h, &scope, unit, close_parent).await) })?);
    }
    parent.join().await?;
    for (i, task) in tasks.iter().enumerate() {
        println!("task{}: {}", i + 1, task.try_result()?);
    }
    parent.close()
}

/// The parent's owner calls `compute_with` itself, so the close attempt
/// comes from the right owner but the child scope is still open.
async fn close_from_owner(h: &Handle, unit: Duration) -> Result<()> {
    let parent = h.open_scope("ParentScope", Policy::ShutdownOnFailure);
    let result = compute_with(h, &parent.share(), unit, true).await;
    println!("result: {}", result);
    parent.join().await?;
    parent.close()
}

/// Returns the sum of both forked results, or -1 after reporting an error.
async fn compute_with(h: &Handle, parent: &ScopeRef, unit: Duration, close_parent: bool) -> i64 {
    let child = h.open_scope("ChildScope", Policy::ShutdownOnFailure);
    let attempt = async {
        let task3 = child.fork(sleep_then_return(2 * unit, 3))?;
        let task4 = parent.fork(sleep_then_return(unit, 4))?;
        child.join().await?;

        if close_parent {
            parent.close()?;
        }

        let three = task3.try_result()?;
        let four = task4.join().await?;
        println!("task3: {}", three);
        println!("task4: {}", four);
        Ok::<_, Error>(three + four)
    };
    let result = attempt.await;
    // Whatever happened above, the child has been joined or its forks failed.
    if let Err(e) = child.join().await.and_then(|_| child.close()) {
        eprintln!("{}: {}", output::error_label(), e);
    }
    match result {
        Ok(sum) => sum,
        Err(e) => {
            eprintln!("{}: {}", output::error_label(), e);
            -1
        }
    }
}

async fn sleep_then_return(d: Duration, value: i64) -> Result<i64> {
    sleep(d).await?;
    Ok(value)
}
