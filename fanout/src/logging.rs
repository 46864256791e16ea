//! Log output for binaries built on fanout.
//!
//! Logs go to stderr. Worker processes use stdout for their protocol, and they
//! inherit the parent's stderr, so parent and worker logs end up in the same
//! place.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ConfigStore;

/// Installs a global subscriber filtering at `level`. `RUST_LOG` takes
/// precedence when set.
///
/// Returns `false` if a global subscriber was already installed, in which case
/// nothing changes.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok()
}

/// [`init`] at the level configured in `config`.
pub fn init_from(config: &ConfigStore) -> bool {
    init(&config.log_level())
}
