// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! skein CLI - runtime demos and benchmarks.

mod commands;
mod help;
mod output;

use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

fn main() {
    output::init();
    init_logging();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        help::print_usage();
        return;
    }

    let rest = &args[2..];
    if rest.iter().any(|a| a == "--help" || a == "-h") {
        help::print_command_help(&args[1]);
        return;
    }

    match args[1].as_str() {
        "bench" => {
            if rest.len() < 3 {
                eprintln!(
                    "{}: skein bench <lightweight|native> <gc|nogc> <count> [options]",
                    output::usage_label()
                );
                process::exit(1);
            }
            commands::bench::cmd_bench(rest);
        }
        "clinit" => commands::clinit::cmd_clinit(rest),
        "contention" => commands::contention::cmd_contention(rest),
        "structured" => {
            if rest.is_empty() {
                eprintln!(
                    "{}: skein structured <fork-from-parent|close-parent-in-child|close-with-open-child>",
                    output::usage_label()
                );
                process::exit(1);
            }
            commands::structured::cmd_structured(rest);
        }
        "help" | "--help" | "-h" => match rest.first() {
            Some(cmd) => help::print_command_help(cmd),
            None => help::print_usage(),
        },
        "version" | "--version" | "-V" => {
            println!("skein {}", env!("CARGO_PKG_VERSION"));
        }
        other => {
            eprintln!("{}: unknown command: {}", output::error_label(), other);
            help::print_usage();
            process::exit(1);
        }
    }
}

/// `SKEIN_LOG` wins over `RUST_LOG`; warnings only by default.
fn init_logging() {
    let filter = EnvFilter::try_from_env("SKEIN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
