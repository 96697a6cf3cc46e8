// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Help text for CLI commands.

use colored::Colorize;
use crate::output;

pub fn print_usage() {
    println!(
        "{} {} - Lightweight tasks, structured scopes, init guards",
        output::title("skein"),
        output::version(env!("CARGO_PKG_VERSION"))
    );
    println!();
    println!(
        "{}: {} {} {}",
        output::section_header("Usage"),
        output::command("skein"),
        output::arg("<command>"),
        output::arg("[args]")
    );
    println!();
    println!("{}", output::section_header("Demos:"));
    println!("  {} {}       Start/finish latch benchmark", output::command("bench"), output::arg("<mode> <gc> <n>"));
    println!("  {}                  Tasks waiting on a slow one-time init", output::command("clinit"));
    println!("  {}              Many writers on one lock, with a runtime dump", output::command("contention"));
    println!("  {} {}   Scope ownership rules", output::command("structured"), output::arg("<case>"));
    println!();
    println!("  {}                    Show this help", output::command("help"));
    println!("  {}                 Show version", output::command("version"));
    println!();
    println!("{}", output::section_header("Environment:"));
    println!("  {}    Log filter (falls back to RUST_LOG, default warn)", output::arg("SKEIN_LOG"));
    println!("  {}  Runtime overrides, e.g. SKEIN_CARRIERS=4", output::arg("SKEIN_*"));
    println!("  {}     Disable colored output", output::arg("NO_COLOR"));
}

pub fn print_command_help(cmd: &str) {
    match cmd {
        "bench" => print_bench_help(),
        "clinit" => print_clinit_help(),
        "contention" => print_contention_help(),
        "structured" => print_structured_help(),
        _ => print_usage(),
    }
}

pub fn print_bench_help() {
    println!("{}", output::section_header("Bench"));
    println!();
    println!("Start <count> tasks that count down a started latch, walk a fixed");
    println!("frame budget and wait on a shared go latch. Reports start, finish");
    println!("and shutdown times per round.");
    println!();
    println!("{}: {} {} {}", "Usage".yellow(),
        output::command("skein"),
        output::command("bench"),
        output::arg("<lightweight|native> <gc|nogc> <count> [options]"));
    println!();
    println!("{}", output::section_header("Modes:"));
    println!("  {}  Tasks on the carrier pool", output::arg("lightweight"));
    println!("  {}       One OS thread per task", output::arg("native"));
    println!("  {}           Churn the allocator after all tasks started", output::arg("gc"));
    println!();
    println!("{}", output::section_header("Options:"));
    println!("  {} {}    Rounds to run (default 10)", output::arg("--rounds"), output::arg("<n>"));
    println!("  {} {}  Carrier threads (default: available parallelism)", output::arg("--carriers"), output::arg("<n>"));
    println!("  {} {}    Frames walked before waiting (default 100)", output::arg("--frames"), output::arg("<n>"));
    println!();
    println!("{}", output::section_header("Examples:"));
    println!("  {} {} {}",
        output::command("skein"),
        output::command("bench"),
        output::arg("lightweight nogc 100000"));
    println!("  {} {} {}",
        output::command("skein"),
        output::command("bench"),
        output::arg("native nogc 2000 --rounds 3"));
}

pub fn print_clinit_help() {
    println!("{}", output::section_header("Clinit"));
    println!();
    println!("A slow database init guarded by run-once, a service endpoint whose");
    println!("own init waits for the database, and request handlers that wait");
    println!("for the endpoint. With --pinned every init wait holds its carrier,");
    println!("so the handlers can starve the database init of a carrier.");
    println!();
    println!("{}: {} {} {}", "Usage".yellow(),
        output::command("skein"),
        output::command("clinit"),
        output::arg("[options]"));
    println!();
    println!("{}", output::section_header("Options:"));
    println!("  {}             Init waits pin their carrier", output::arg("--pinned"));
    println!("  {} {}   Concurrent requests (default 100)", output::arg("--requests"), output::arg("<n>"));
    println!("  {} {}   Carrier threads (default 4)", output::arg("--carriers"), output::arg("<n>"));
    println!("  {} {}     Request rounds (default 3)", output::arg("--rounds"), output::arg("<n>"));
    println!("  {} {}    Database init time (default 2000)", output::arg("--init-ms"), output::arg("<ms>"));
    println!("  {} {}  Give up and report after this long (default 10000)", output::arg("--timeout-ms"), output::arg("<ms>"));
}

pub fn print_contention_help() {
    println!("{}", output::section_header("Contention"));
    println!();
    println!("Writers repeatedly swap a shared counter under one lock. Halfway");
    println!("through, a runtime dump shows who holds a carrier and who is parked.");
    println!();
    println!("{}: {} {} {}", "Usage".yellow(),
        output::command("skein"),
        output::command("contention"),
        output::arg("[options]"));
    println!();
    println!("{}", output::section_header("Options:"));
    println!("  {}  Use the monitor (pins) instead of the lock", output::arg("--synchronized"));
    println!("  {} {}     Writer tasks (default 40)", output::arg("--writers"), output::arg("<n>"));
    println!("  {} {}      Run time (default 1000)", output::arg("--millis"), output::arg("<ms>"));
    println!("  {} {}    Carrier threads (default 4)", output::arg("--carriers"), output::arg("<n>"));
    println!("  {} {}        Spin iterations inside the lock (default 100000)", output::arg("--work"), output::arg("<n>"));
    println!("  {}           Print the dump as JSON", output::arg("--json"));
}

pub fn print_structured_help() {
    println!("{}", output::section_header("Structured"));
    println!();
    println!("Scope ownership cases.");
    println!();
    println!("{}: {} {} {}", "Usage".yellow(),
        output::command("skein"),
        output::command("structured"),
        output::arg("<case> [--unit-ms <ms>]"));
    println!();
    println!("{}", output::section_header("Cases:"));
    println!("  {}       Children fork into the parent scope", output::arg("fork-from-parent"));
    println!("  {}  A child task tries to close the parent (wrong owner)", output::arg("close-parent-in-child"));
    println!("  {}  The owner closes the parent with a child still open", output::arg("close-with-open-child"));
    println!();
    println!("{}", output::section_header("Options:"));
    println!("  {} {}  Sleep unit (default 1000)", output::arg("--unit-ms"), output::arg("<ms>"));
}
