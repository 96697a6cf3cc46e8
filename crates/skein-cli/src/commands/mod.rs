// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! CLI command implementations.

pub mod bench;
pub mod clinit;
pub mod contention;
pub mod structured;

use std::fmt::Display;
use std::process;
use std::str::FromStr;

use skein_rt::{Runtime, RuntimeConfig};

use crate::output;

/// `--name value` options and bare `--switch`es after the positional args.
pub struct Flags<'a> {
    args: &'a [String],
}

impl<'a> Flags<'a> {
    pub fn new(args: &'a [String]) -> Self {
        Self { args }
    }

    pub fn has(&self, name: &str) -> bool {
        self.args.iter().any(|a| a == name)
    }

    /// Value following `name`, or `default` if the flag is absent.
    pub fn value<T>(&self, name: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(pos) = self.args.iter().position(|a| a == name) else {
            return default;
        };
        let Some(raw) = self.args.get(pos + 1) else {
            die(format!("{} needs a value", name));
        };
        match raw.parse() {
            Ok(v) => v,
            Err(e) => die(format!("bad value `{}` for {}: {}", raw, name, e)),
        }
    }
}

/// `SKEIN_*` overrides first, then `--carriers`.
pub fn runtime_config(flags: &Flags, default_carriers: usize) -> RuntimeConfig {
    let config = RuntimeConfig::from_env().unwrap_or_else(|e| die(e));
    let carriers = if config.carriers == 0 {
        default_carriers
    } else {
        config.carriers
    };
    config.carriers(flags.value("--carriers", carriers))
}

pub fn start_runtime(config: RuntimeConfig) -> Runtime {
    Runtime::new(config).unwrap_or_else(|e| die(e))
}

pub fn die(msg: impl Display) -> ! {
    eprintln!("{}: {}", output::error_label(), msg);
    process::exit(1);
}
