// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Integration tests for the `skein` demos.
//! Each test runs the binary with small sizes and checks its output.

use std::path::PathBuf;
use std::process::{Command, Output};

fn skein_binary() -> PathBuf {
    // cargo test builds into target/debug or target/release
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("skein");
    path
}

fn skein(args: &[&str]) -> Output {
    Command::new(skein_binary())
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("SKEIN_CARRIERS")
        .env_remove("SKEIN_LOG")
        .output()
        .expect("failed to run skein")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn assert_ok(out: &Output) {
    assert!(
        out.status.success(),
        "skein failed:\nstdout: {}\nstderr: {}",
        stdout(out),
        stderr(out)
    );
}

#[test]
fn help_lists_demos() {
    let out = skein(&["help"]);
    assert_ok(&out);
    let text = stdout(&out);
    for cmd in ["bench", "clinit", "contention", "structured"] {
        assert!(text.contains(cmd), "missing {} in:\n{}", cmd, text);
    }
}

#[test]
fn unknown_command_fails() {
    let out = skein(&["frobnicate"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("unknown command"));
}

#[test]
fn bench_lightweight_reports_each_round() {
    let out = skein(&["bench", "lightweight", "nogc", "2000", "--rounds", "2", "--carriers", "2"]);
    assert_ok(&out);
    let text = stdout(&out);
    assert_eq!(text.matches("All threads started in").count(), 2);
    assert_eq!(text.matches("All threads finished in").count(), 2);
    assert!(text.contains("main: Shutdown in"));
}

#[test]
fn bench_native_with_churn() {
    let out = skein(&["bench", "native", "gc", "50", "--rounds", "1"]);
    assert_ok(&out);
    let text = stdout(&out);
    assert!(text.contains("main: All threads started in"));
    assert!(text.contains("main: All threads finished in"));
}

#[test]
fn bench_rejects_bad_mode() {
    let out = skein(&["bench", "fibers", "nogc", "10"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("unknown mode"));
}

#[test]
fn clinit_cooperative_completes() {
    let out = skein(&[
        "clinit", "--requests", "20", "--rounds", "2", "--carriers", "2", "--init-ms", "200",
    ]);
    assert_ok(&out);
    let text = stdout(&out);
    assert_eq!(text.matches("Initializing DBConnection to database.").count(), 1);
    assert_eq!(text.matches("is READY!").count(), 1);
    assert_eq!(text.matches('R').count() - text.matches("READY").count(), 40);
    assert!(text.contains("Handled 40 requests"));
}

#[test]
fn clinit_pinned_stalls_and_reports() {
    let out = skein(&[
        "clinit",
        "--pinned",
        "--requests",
        "10",
        "--rounds",
        "1",
        "--carriers",
        "2",
        "--init-ms",
        "200",
        "--timeout-ms",
        "1500",
    ]);
    assert!(!out.status.success());
    let text = stdout(&out);
    assert!(text.contains("being initialized by"), "stdout:\n{}", text);
    assert!(text.contains("[pinned]"));
    assert!(text.contains("deadlock risk"));
    assert!(text.contains("✗ 0 of 10 handlers finished"));
    assert!(stderr(&out).contains("requests stalled with 2 of 2 carriers pinned"));
}

#[test]
fn contention_prints_dump() {
    let out = skein(&[
        "contention", "--writers", "8", "--millis", "200", "--carriers", "2", "--work", "1000",
    ]);
    assert_ok(&out);
    let text = stdout(&out);
    assert!(text.contains("runtime dump"));
    assert!(text.contains("carriers: 2"));
    assert!(text.contains("critical sections"));
}

#[test]
fn contention_json_snapshot() {
    let out = skein(&[
        "contention",
        "--synchronized",
        "--json",
        "--writers",
        "8",
        "--millis",
        "200",
        "--carriers",
        "2",
        "--work",
        "1000",
    ]);
    assert_ok(&out);
    let snap: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(snap["carriers"].as_array().unwrap().len(), 2);
    assert!(snap["tasks"].as_array().unwrap().len() <= 8);
    assert_eq!(snap["scopes"][0]["name"], "writers");
}

#[test]
fn structured_fork_from_parent() {
    let out = skein(&["structured", "fork-from-parent", "--unit-ms", "20"]);
    assert_ok(&out);
    let text = stdout(&out);
    assert_eq!(text.matches("task3: 3").count(), 2);
    assert_eq!(text.matches("task4: 4").count(), 2);
    assert!(text.contains("task1: 7"));
    assert!(text.contains("task2: 7"));
    assert!(text.contains("✓ every scope closed"));
}

#[test]
fn structured_close_parent_in_child() {
    let out = skein(&["structured", "close-parent-in-child", "--unit-ms", "20"]);
    assert_ok(&out);
    assert!(stdout(&out).contains("task1: -1"));
    let err = stderr(&out);
    assert_eq!(err.matches("does not own scope `ParentScope`").count(), 2);
}

#[test]
fn structured_close_with_open_child() {
    let out = skein(&["structured", "close-with-open-child", "--unit-ms", "20"]);
    assert_ok(&out);
    assert!(stdout(&out).contains("result: -1"));
    assert!(stderr(&out).contains("still has 1 open child scope(s)"));
}
