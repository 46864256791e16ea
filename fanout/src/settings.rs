//! Execution settings and the option layers they are resolved from.
//!
//! [`Options`] is a partial set of knobs: a call site, the environment and the
//! global [`Config`](crate::Config) each provide one. Resolution layers them
//! (call site first) on top of the built-in defaults and validates the result
//! into an [`ExecutionSettings`], which is then fixed for the lifetime of the
//! dispatcher that asked for it.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    pool::PoolKey,
    rate::RateLimit,
};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Above this many workers a warning is logged.
pub const HIGH_WORKER_COUNT: usize = 100;

pub const ENV_WORKERS: &str = "FANOUT_WORKERS";
pub const ENV_BATCH_SIZE: &str = "FANOUT_BATCH_SIZE";
pub const ENV_EXECUTOR: &str = "FANOUT_EXECUTOR";
pub const ENV_RATE_LIMIT: &str = "FANOUT_RATE_LIMIT";
pub const ENV_PREWARM: &str = "FANOUT_PREWARM";

/// Where tasks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Worker threads in this process.
    #[default]
    Thread,
    /// Worker threads that each drive a child process.
    Process,
}

impl FromStr for ExecutorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            other => Err(Error::config(format!(
                "unknown executor {other:?}, expected thread or process"
            ))),
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Thread => "thread",
            Self::Process => "process",
        })
    }
}

/// Fully resolved settings for one dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSettings {
    pub workers: usize,
    /// Informational. Does not change how many tasks run at once.
    pub batch_size: usize,
    pub executor: ExecutorKind,
    pub rate_limit: Option<RateLimit>,
    pub prewarm: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            executor: ExecutorKind::Thread,
            rate_limit: None,
            prewarm: false,
        }
    }
}

impl ExecutionSettings {
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(self.executor, self.workers)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        Ok(())
    }

    /// Settings that are valid but probably not what the caller wants.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.workers > HIGH_WORKER_COUNT {
            warnings.push(format!(
                "high number of workers ({}) may impact system performance",
                self.workers
            ));
        }
        if self.executor == ExecutorKind::Process {
            if self.batch_size < 2 {
                warnings.push(
                    "process pool with a batch size below 2 spends most of its time \
                     on serialisation; consider a larger batch or a thread pool"
                        .to_string(),
                );
            }
            let cpus = num_cpus::get();
            if self.workers > cpus {
                warnings.push(format!(
                    "process pool has {} workers but only {cpus} CPUs are available",
                    self.workers
                ));
            }
        }
        warnings
    }
}

/// A partial set of execution knobs.
///
/// Unset fields fall through to the next layer during resolution.
///
/// ```
/// use fanout::{ExecutorKind, Options, RateLimit};
///
/// let options = Options::builder()
///     .workers(8)
///     .rate_limit(RateLimit::per_second(5.0).unwrap())
///     .build();
/// assert_eq!(options.workers, Some(8));
/// assert_eq!(options.executor, None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
pub struct Options {
    pub workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub executor: Option<ExecutorKind>,
    pub rate_limit: Option<RateLimit>,
    pub prewarm: Option<bool>,
}

impl Options {
    /// Fields set on `self` win; the rest come from `fallback`.
    pub fn or(&self, fallback: &Options) -> Options {
        Options {
            workers: self.workers.or(fallback.workers),
            batch_size: self.batch_size.or(fallback.batch_size),
            executor: self.executor.or(fallback.executor),
            rate_limit: self.rate_limit.or(fallback.rate_limit),
            prewarm: self.prewarm.or(fallback.prewarm),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Options::default()
    }

    /// Reads the `FANOUT_*` variables of the current process.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Reads `FANOUT_*` settings from arbitrary key/value pairs. Unrelated keys
    /// and empty values are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Options::default();
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            if value.is_empty() {
                continue;
            }
            match key {
                ENV_WORKERS => options.workers = Some(parse_count(key, value)?),
                ENV_BATCH_SIZE => options.batch_size = Some(parse_count(key, value)?),
                ENV_EXECUTOR => {
                    options.executor = Some(value.parse().map_err(|e| env_error(key, e))?)
                }
                ENV_RATE_LIMIT => {
                    options.rate_limit = Some(value.parse().map_err(|e| env_error(key, e))?)
                }
                ENV_PREWARM => options.prewarm = Some(parse_flag(key, value)?),
                _ => {}
            }
        }
        Ok(options)
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::config(format!(
            "{key} must be a positive integer, got {value:?}"
        ))),
    }
}

pub(crate) fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "{key} must be a boolean, got {value:?}"
        ))),
    }
}

fn env_error(key: &str, err: Error) -> Error {
    match err {
        Error::Config(message) => Error::config(format!("{key}: {message}")),
        other => other,
    }
}
