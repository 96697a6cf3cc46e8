// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Values are resolved in this order (highest priority first):
//!
//! 1. Builder setters on [`RuntimeConfig`]
//! 2. `SKEIN_*` environment variables via [`RuntimeConfig::from_env`]
//! 3. Defaults
//!
//! | Variable | Maps to |
//! |----------|---------|
//! | `SKEIN_CARRIERS` | `carriers` |
//! | `SKEIN_THREAD_NAME_PREFIX` | `thread_name_prefix` |
//! | `SKEIN_SATURATION_MARGIN` | `saturation_margin` |
//! | `SKEIN_WATCHDOG_MS` | `watchdog_interval` |
//! | `SKEIN_INIT_RECHECK_MS` | `init_recheck_interval` |
//! | `SKEIN_INTERRUPT_POLICY` | `interrupt_policy` (`propagate` / `ignore`) |
//! | `SKEIN_INIT_FAILURE_POLICY` | `init_failure_policy` (`retry` / `sticky`) |
//! | `SKEIN_PIN_<RESOURCE>` | `pins[<resource>]` (`true` / `false`) |

use std::collections::BTreeMap;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gate::Resource;

pub const ENV_CARRIERS: &str = "SKEIN_CARRIERS";
pub const ENV_THREAD_NAME_PREFIX: &str = "SKEIN_THREAD_NAME_PREFIX";
pub const ENV_SATURATION_MARGIN: &str = "SKEIN_SATURATION_MARGIN";
pub const ENV_WATCHDOG_MS: &str = "SKEIN_WATCHDOG_MS";
pub const ENV_INIT_RECHECK_MS: &str = "SKEIN_INIT_RECHECK_MS";
pub const ENV_INTERRUPT_POLICY: &str = "SKEIN_INTERRUPT_POLICY";
pub const ENV_INIT_FAILURE_POLICY: &str = "SKEIN_INIT_FAILURE_POLICY";
/// Prefix for per-resource pin overrides, e.g. `SKEIN_PIN_MONITOR=false`.
pub const ENV_PIN_PREFIX: &str = "SKEIN_PIN_";

/// What a cooperative wait does when its task is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptPolicy {
    /// Return `Error::Cancelled` from the wait.
    #[default]
    Propagate,
    /// Log the interrupt and keep waiting.
    Ignore,
}

impl FromStr for InterruptPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "propagate" => Ok(Self::Propagate),
            "ignore" => Ok(Self::Ignore),
            other => Err(Error::InvalidConfig(format!(
                "unknown interrupt policy `{}` (expected propagate or ignore)",
                other
            ))),
        }
    }
}

/// What an init guard does after its initializer fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitFailurePolicy {
    /// Waiters see the failure, then the key resets so a later call retries.
    #[default]
    Retry,
    /// The failure is remembered and returned to every later caller.
    Sticky,
}

impl FromStr for InitFailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "retry" => Ok(Self::Retry),
            "sticky" => Ok(Self::Sticky),
            other => Err(Error::InvalidConfig(format!(
                "unknown init failure policy `{}` (expected retry or sticky)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Carrier threads. 0 means available parallelism.
    pub carriers: usize,
    pub thread_name_prefix: String,
    /// Per-carrier queue bound before tasks spill into the global queue.
    pub local_queue_capacity: usize,
    /// How long an idle carrier sleeps before re-checking for steals.
    pub idle_park: Duration,
    /// Period of the pinned-carrier saturation check.
    pub watchdog_interval: Duration,
    /// Deadlock risk fires when `pinned + margin >= carriers`.
    pub saturation_margin: usize,
    /// How often init-guard waiters log that they are still waiting.
    pub init_recheck_interval: Duration,
    pub init_failure_policy: InitFailurePolicy,
    pub interrupt_policy: InterruptPolicy,
    /// Overrides of `Resource::default_pins`.
    pub pins: BTreeMap<Resource, bool>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            carriers: 0,
            thread_name_prefix: "carrier".to_string(),
            local_queue_capacity: 1024,
            idle_park: Duration::from_millis(5),
            watchdog_interval: Duration::from_millis(100),
            saturation_margin: 1,
            init_recheck_interval: Duration::from_secs(1),
            init_failure_policy: InitFailurePolicy::default(),
            interrupt_policy: InterruptPolicy::default(),
            pins: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults plus `SKEIN_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn carriers(mut self, n: usize) -> Self {
        self.carriers = n;
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn local_queue_capacity(mut self, n: usize) -> Self {
        self.local_queue_capacity = n;
        self
    }

    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn saturation_margin(mut self, margin: usize) -> Self {
        self.saturation_margin = margin;
        self
    }

    pub fn init_recheck_interval(mut self, interval: Duration) -> Self {
        self.init_recheck_interval = interval;
        self
    }

    pub fn init_failure_policy(mut self, policy: InitFailurePolicy) -> Self {
        self.init_failure_policy = policy;
        self
    }

    pub fn interrupt_policy(mut self, policy: InterruptPolicy) -> Self {
        self.interrupt_policy = policy;
        self
    }

    /// Declare whether waits on `resource` pin their carrier.
    pub fn pin(mut self, resource: Resource, pins: bool) -> Self {
        self.pins.insert(resource, pins);
        self
    }

    /// Effective pin flag for `resource`.
    pub fn pins(&self, resource: Resource) -> bool {
        self.pins
            .get(&resource)
            .copied()
            .unwrap_or_else(|| resource.default_pins())
    }

    /// Carrier count with `0` resolved to the machine's parallelism.
    pub fn resolved_carriers(&self) -> usize {
        if self.carriers == 0 {
            thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        } else {
            self.carriers
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "local_queue_capacity must be at least 1".into(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(Error::InvalidConfig(
                "thread_name_prefix must not be empty".into(),
            ));
        }
        if self.watchdog_interval.is_zero() || self.init_recheck_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "watchdog and init recheck intervals must be non-zero".into(),
            ));
        }
        if self.idle_park.is_zero() {
            return Err(Error::InvalidConfig("idle_park must be non-zero".into()));
        }
        Ok(())
    }

    /// Apply `SKEIN_*` variables that are set. Unparseable values are errors.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(val) = read_env(ENV_CARRIERS) {
            self.carriers = parse_usize(ENV_CARRIERS, &val)?;
        }
        if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
            self.thread_name_prefix = val;
        }
        if let Some(val) = read_env(ENV_SATURATION_MARGIN) {
            self.saturation_margin = parse_usize(ENV_SATURATION_MARGIN, &val)?;
        }
        if let Some(val) = read_env(ENV_WATCHDOG_MS) {
            self.watchdog_interval = parse_millis(ENV_WATCHDOG_MS, &val)?;
        }
        if let Some(val) = read_env(ENV_INIT_RECHECK_MS) {
            self.init_recheck_interval = parse_millis(ENV_INIT_RECHECK_MS, &val)?;
        }
        if let Some(val) = read_env(ENV_INTERRUPT_POLICY) {
            self.interrupt_policy = val.parse()?;
        }
        if let Some(val) = read_env(ENV_INIT_FAILURE_POLICY) {
            self.init_failure_policy = val.parse()?;
        }
        for resource in Resource::ALL {
            let var = format!("{}{}", ENV_PIN_PREFIX, resource.name().to_ascii_uppercase());
            if let Some(val) = read_env(&var) {
                self.pins.insert(resource, parse_bool(&var, &val)?);
            }
        }
        Ok(())
    }
}

fn read_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_usize(var: &str, val: &str) -> Result<usize> {
    val.trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{}={} is not a count", var, val)))
}

fn parse_millis(var: &str, val: &str) -> Result<Duration> {
    val.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| Error::InvalidConfig(format!("{}={} is not milliseconds", var, val)))
}

fn parse_bool(var: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidConfig(format!("{}={} is not a boolean", var, val))),
    }
}
