// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! CLI output formatting with colors and styling.
//!
//! Respects NO_COLOR and FORCE_COLOR environment variables.
//! Colors are automatically disabled when output is piped.

use std::thread;
use std::time::Duration;

use colored::{ColoredString, Colorize};

/// Initialize color support based on environment.
/// Call once at startup.
pub fn init() {
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    } else if std::env::var("FORCE_COLOR").is_ok() {
        colored::control::set_override(true);
    }
}

// === Harness lines ===

/// Print `<thread-name>: <msg>`, the way every demo reports progress.
pub fn log(msg: &str) {
    let current = thread::current();
    let name = current.name().unwrap_or("unnamed");
    println!("{}: {}", name.dimmed(), msg);
}

pub fn millis(d: Duration) -> u128 {
    d.as_millis()
}

// === Error Output ===

pub fn error_label() -> ColoredString {
    "error".red().bold()
}

pub fn warning_label() -> ColoredString {
    "warning".yellow().bold()
}

pub fn usage_label() -> ColoredString {
    "usage".cyan()
}

// === Status Output ===

pub fn status_pass() -> ColoredString {
    "✓".green()
}

pub fn status_fail() -> ColoredString {
    "✗".red()
}

pub fn banner(msg: &str) -> String {
    format!("{} {} {}", "===".dimmed(), msg.bold(), "===".dimmed())
}

// === Help Output ===

pub fn title(name: &str) -> ColoredString {
    name.bold()
}

pub fn version(v: &str) -> ColoredString {
    v.dimmed()
}

pub fn section_header(header: &str) -> ColoredString {
    header.yellow().bold()
}

pub fn command(name: &str) -> ColoredString {
    name.green()
}

pub fn arg(name: &str) -> ColoredString {
    name.cyan()
}

pub fn separator(width: usize) -> ColoredString {
    "─".repeat(width).dimmed()
}
