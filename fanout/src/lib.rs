//! Fanout: run a function over many items on a shared worker pool.
//!
//! You write the function for one item; fanout applies it to a batch,
//! concurrently, on a bounded pool, optionally throttled to a maximum rate,
//! and hands the results back in input order. A single item is a batch of one:
//! it yields a one-element vector, so callers never branch on the shape of the
//! result.
//!
//! ```
//! use fanout::parallel;
//!
//! #[parallel(workers = 4)]
//! fn double(x: u32) -> u32 {
//!     x * 2
//! }
//!
//! assert_eq!(double(vec![1, 2, 3]).unwrap(), vec![2, 4, 6]);
//! assert_eq!(double(21).unwrap(), vec![42]);
//! ```
//!
//! # Architecture
//!
//! - [`Engine`]: the composition point. It owns the configuration and the
//!   pool registry and hands out dispatchers.
//! - [`ConfigStore`]: global defaults plus the `FANOUT_*` environment layer.
//!   Settings are resolved once, when a dispatcher is built, in the order
//!   call site, environment, configuration, built-in defaults.
//! - [`Dispatcher`] / [`Parallel`]: classify the input, pace submissions
//!   through a [`RateLimiter`], submit one task per item and collect results
//!   in order. The first failure fails the call.
//! - [`PoolRegistry`]: one shared [`WorkerPool`] per executor kind and worker
//!   count, reused across calls and dispatchers.
//! - [`WorkerPool`]: OS worker threads fed from one queue. Process pools pair
//!   each worker thread with a child process running [`RemoteTask`]s.
//!
//! # Design goals
//!
//! - Same answer whatever the interleaving: result `i` belongs to item `i`.
//! - Pools are expensive, dispatchers are cheap. Dispatchers with the same
//!   pool shape share one pool.
//! - Configuration errors surface when settings are resolved, never halfway
//!   through a batch.
//!
//! # Feature flags
//! - `macros` (default): the [`parallel`] attribute.

/// Dispatching batches over pools
pub mod dispatch;
/// Engine, the composition point
pub mod engine;
/// Worker pools and task handles
pub mod pool;
/// Rate limits and the token bucket
pub mod rate;
/// Registry of shared pools
pub mod registry;
/// Named tasks for worker processes
pub mod remote;
/// Execution settings and option layers
pub mod settings;

pub mod config;
pub mod error;
pub mod logging;
pub mod worker;

pub use config::{Config, ConfigStore, ExecutionConfig};
pub use dispatch::{Batch, Dispatcher, Parallel};
pub use engine::Engine;
pub use error::{BoxError, Error, Result, TaskError};
pub use pool::{PoolKey, ProcessCommand, TaskHandle, WorkerContext, WorkerPool};
pub use rate::{Interval, RateLimit, RateLimiter};
pub use registry::PoolRegistry;
pub use remote::{RemoteTask, TaskTable};
pub use settings::{ExecutionSettings, ExecutorKind, Options};

#[cfg(feature = "macros")]
pub use fanout_macros::parallel;

/// Support code for `#[parallel]`. Not public API.
#[doc(hidden)]
pub mod __private {
    pub use std::sync::OnceLock;

    use crate::{Dispatcher, Engine, Options, RateLimit, Result};

    /// The dispatcher cached in `cell`, built from the global engine on first
    /// use.
    pub fn dispatcher<F>(cell: &'static OnceLock<Dispatcher>, options: F) -> Result<&'static Dispatcher>
    where
        F: FnOnce() -> Result<Options>,
    {
        if let Some(dispatcher) = cell.get() {
            return Ok(dispatcher);
        }
        let dispatcher = Engine::global()?.dispatcher(&options()?)?;
        // A racing caller may have won; theirs is kept.
        Ok(cell.get_or_init(|| dispatcher))
    }

    pub fn rate_limit(spec: &str) -> Result<RateLimit> {
        spec.parse()
    }
}
