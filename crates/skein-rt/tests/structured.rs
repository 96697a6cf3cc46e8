// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Structured scope scenarios: failure propagation, close ordering and
//! forking into an ancestor scope.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use skein_rt::time::sleep;
use skein_rt::{Error, Handle, Phase, Policy, Runtime, TaskHandle, TaskState, Violation};

#[test]
fn shutdown_on_failure_cancels_siblings_before_join_returns() {
    let rt = Runtime::with_carriers(4).unwrap();
    let handle = rt.handle();

    let (err, states) = rt
        .block_on(async move {
            let scope = handle.open_scope("fail-fast", Policy::ShutdownOnFailure);
            let mut siblings = Vec::new();
            for _ in 0..5 {
                siblings.push(scope.fork(async {
                    sleep(Duration::from_secs(30)).await?;
                    Ok::<_, Error>(())
                })?);
            }
            scope.fork(async {
                sleep(Duration::from_millis(20)).await?;
                Err::<(), _>(Error::failed("disk on fire"))
            })?;

            let err = scope.join().await.unwrap_err();
            // Every sibling is already terminal when join returns.
            let states: Vec<_> = siblings.iter().map(|h| h.state()).collect();
            scope.close()?;
            Ok::<_, Error>((err, states))
        })
        .unwrap();

    assert!(matches!(err, Error::TaskFailed { .. }));
    assert!(matches!(err.root_cause(), Error::Failed(m) if m == "disk on fire"));
    assert!(states.iter().all(|s| *s == TaskState::Cancelled));
}

#[test]
fn close_requires_join_first() {
    let rt = Runtime::with_carriers(2).unwrap();
    let handle = rt.handle();
    rt.block_on(async move {
        let scope = handle.open_scope("ordered", Policy::CollectAll);
        scope.fork(async {
            sleep(Duration::from_millis(10)).await?;
            Ok::<_, Error>(())
        })?;

        let err = scope.close().unwrap_err();
        assert!(matches!(
            err,
            Error::StructureViolation(Violation::UnjoinedTasks { .. })
        ));

        let report = scope.join().await?;
        assert_eq!(report.completed, 1);
        scope.close()?;
        assert_eq!(scope.phase(), Phase::Closed);
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn fork_after_join_needs_another_join() {
    let rt = Runtime::with_carriers(2).unwrap();
    let handle = rt.handle();
    rt.block_on(async move {
        let scope = handle.open_scope("twice", Policy::CollectAll);
        scope.fork(async { Ok(1) })?;
        scope.join().await?;
        scope.fork(async { Ok(2) })?;
        assert!(scope.close().unwrap_err().is_structure_violation());
        let report = scope.join().await?;
        assert_eq!(report.completed, 2);
        scope.close()?;
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn fork_into_ancestor_and_close_from_child() {
    let rt = Runtime::with_carriers(4).unwrap();
    let handle = rt.handle();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_in = ran.clone();

    rt.block_on(async move {
        let parent = handle.open_scope("parent", Policy::CollectAll);
        let child = handle.open_scope("child", Policy::CollectAll);
        assert_eq!(child.parent(), Some(parent.id()));

        let p = parent.share();
        let a = child.share();
        let ran_x = ran_in.clone();
        let x = child.fork(async move {
            // Y lands in the parent scope even though X runs in the child.
            let ran_y = ran_x.clone();
            let y = p.fork(async move {
                sleep(Duration::from_millis(20)).await?;
                ran_y.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(())
            })?;
            ran_x.fetch_add(1, Ordering::SeqCst);
            let close_err = a.close().unwrap_err();
            Ok::<_, Error>((y.id(), close_err))
        })?;

        let (y_id, close_err) = x.join().await?;
        assert!(matches!(
            close_err,
            Error::StructureViolation(Violation::WrongOwner { .. })
        ));

        child.join().await?;
        child.close()?;
        let report = parent.join().await?;
        assert_eq!(report.completed, 1);
        parent.close()?;
        assert!(y_id.0 > 0);
        Ok::<_, Error>(())
    })
    .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 2);
}

#[test]
fn fork_from_outside_subtree_is_rejected() {
    let rt = Runtime::with_carriers(2).unwrap();
    let scope = rt.open_scope("private", Policy::CollectAll);
    let shared = scope.share();

    let err = rt
        .spawn(async move { shared.fork(async { Ok(()) }).map(|_| ()) })
        .join_blocking()
        .unwrap_err();
    assert!(matches!(
        err.root_cause(),
        Error::StructureViolation(Violation::NotInScope { .. })
    ));
    scope.close().unwrap();
}

#[test]
fn open_child_blocks_parent_close() {
    let rt = Runtime::with_carriers(2).unwrap();
    let handle = rt.handle();
    rt.block_on(async move {
        let outer = handle.open_scope("outer", Policy::CollectAll);
        let inner_handle = Handle::current()?;
        let inner_owner = outer.fork(async move {
            // A task forked into `outer` opens a nested scope and leaves it open.
            let nested = inner_handle.open_scope("nested", Policy::CollectAll);
            let id = nested.id();
            std::mem::forget(nested);
            Ok::<_, Error>(id)
        })?;
        inner_owner.join().await?;
        outer.join().await?;
        let err = outer.close().unwrap_err();
        assert!(matches!(
            err,
            Error::StructureViolation(Violation::OpenChildScopes { count: 1, .. })
        ));
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn join_deadline_leaves_tasks_running() {
    let rt = Runtime::with_carriers(2).unwrap();
    let handle = rt.handle();
    rt.block_on(async move {
        let scope = handle.open_scope("slow", Policy::CollectAll);
        let task = scope.fork(async {
            sleep(Duration::from_millis(150)).await?;
            Ok::<_, Error>("late")
        })?;

        let start = Instant::now();
        let err = scope.join_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_millis(140));
        assert!(!task.is_finished());

        let report = scope
            .join_until(Instant::now() + Duration::from_secs(5))
            .await?;
        assert_eq!(report.completed, 1);
        assert_eq!(task.try_result()?, "late");
        scope.close()?;
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn cancelled_owner_cancels_scope() {
    let rt = Runtime::with_carriers(2).unwrap();
    let handle = rt.handle();
    let forked: Arc<Mutex<Option<TaskHandle<()>>>> = Arc::new(Mutex::new(None));
    let slot = forked.clone();

    let owner = rt.spawn(async move {
        let scope = handle.open_scope("owned", Policy::CollectAll);
        let h = scope.fork(async {
            sleep(Duration::from_secs(30)).await?;
            Ok::<_, Error>(())
        })?;
        *slot.lock() = Some(h);
        scope.join().await?;
        Ok::<_, Error>(())
    });

    std::thread::sleep(Duration::from_millis(30));
    owner.cancel();
    assert!(owner.join_blocking().unwrap_err().is_cancelled());
    let forked = forked.lock().take().unwrap();
    assert!(forked.join_blocking().unwrap_err().is_cancelled());
}
