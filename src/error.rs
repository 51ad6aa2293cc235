//! Error taxonomy for the connection-observer core.
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the observer/command/event/runner machinery.
///
/// Errors are values carried on the observer, not thrown across thread
/// boundaries: a parser failure is captured by the runner and stored via
/// `set_exception` rather than propagated out of a data handler.
#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("io error: {0}")]
    Io(String),

    #[error("command '{command}' timed out after {passed:?} (limit {timeout:?})")]
    CommandTimeout {
        command: String,
        timeout: Duration,
        passed: Duration,
    },

    #[error("observer '{observer}' timed out after {passed:?} (limit {timeout:?})")]
    ConnectionObserverTimeout {
        observer: String,
        timeout: Duration,
        passed: Duration,
    },

    #[error("command '{command}' failed: {message}")]
    CommandFailure { command: String, message: String },

    #[error("wrong usage: {0}")]
    WrongUsage(String),

    #[error("result already set on '{0}'")]
    ResultAlreadySet(String),

    #[error("result not available yet on '{0}'")]
    ResultNotAvailableYet(String),

    #[error("no result since cancel was called on '{0}'")]
    NoResultSinceCancelCalled(String),

    #[error("connection '{0}' is closed")]
    ConnectionClosed(String),

    #[error("observer '{0}' was forcefully ended by the runner")]
    EndOfLife(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
