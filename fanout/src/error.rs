use std::{any::Any, path::PathBuf};

use crate::pool::PoolKey;

/// Boxed error produced by a user function.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to the caller of a dispatch.
///
/// Configuration problems are reported when settings are resolved or a
/// [`RateLimit`](crate::RateLimit) is built, never halfway through a batch.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to load configuration from {}: {message}", path.display())]
    ConfigFile { path: PathBuf, message: String },

    #[error("failed to spawn worker pool: {0}")]
    PoolSpawn(#[source] std::io::Error),

    #[error("worker pool {0} has been shut down")]
    PoolClosed(PoolKey),

    #[error("failed to prewarm worker pool {key}: {source}")]
    Prewarm {
        key: PoolKey,
        #[source]
        source: TaskError,
    },

    #[error("task {index} failed: {source}")]
    Task {
        index: usize,
        #[source]
        source: TaskError,
    },
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// The failure of the task that aborted the batch, if that is what happened.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            Self::Task { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Why a single task did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(BoxError),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("worker exited before producing a result")]
    Lost,

    #[error("worker process error: {0}")]
    Remote(String),

    #[error("failed to encode or decode task data: {0}")]
    Codec(String),
}

impl TaskError {
    pub(crate) fn failed(error: impl Into<BoxError>) -> Self {
        Self::Failed(error.into())
    }

    /// Turns a payload caught by `catch_unwind` into a readable error.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(panic_message(payload.as_ref()))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let caught = std::panic::catch_unwind(|| -> u8 { panic!("boom {}", 7) }).unwrap_err();
        assert_eq!(TaskError::from_panic(caught).to_string(), "task panicked: boom 7");

        let caught = std::panic::catch_unwind(|| -> u8 { std::panic::panic_any(42u8) }).unwrap_err();
        assert_eq!(
            TaskError::from_panic(caught).to_string(),
            "task panicked: unknown panic payload"
        );
    }

    #[test]
    fn task_error_is_exposed_for_task_failures_only() {
        let err = Error::Task {
            index: 3,
            source: TaskError::Cancelled,
        };
        assert!(matches!(err.task_error(), Some(TaskError::Cancelled)));
        assert_eq!(err.to_string(), "task 3 failed: task was cancelled");
        assert!(Error::config("nope").task_error().is_none());
    }
}
