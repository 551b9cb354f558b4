//! Spool and subprocess error types.

use std::io;
use thiserror::Error;

/// Errors raised by a [`Spool`](crate::Spool).
#[derive(Debug, Error)]
pub enum SpoolError {
    /// Backing storage could not be created, written or read.
    #[error("spool I/O failure: {0}")]
    Io(#[from] io::Error),

    /// The spool was closed and its backing file removed.
    #[error("spool closed")]
    Closed,

    /// The writer went away without marking the end of the data.
    #[error("spool writer dropped before finishing")]
    WriterAborted,
}

/// Errors raised while running a backend process.
#[derive(Debug, Error)]
pub enum PipeError {
    /// The backend executable does not exist.
    #[error("backend tool unavailable: {program}")]
    BackendUnavailable {
        /// Program that was looked up.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: io::Error,
    },

    /// The backend exited with a non-zero status.
    #[error("backend exited with status {code}")]
    BackendFailure {
        /// Exit code reported by the process.
        code: i32,
        /// Captured stderr, truncated.
        stderr: String,
    },

    /// The backend was killed by a signal it did not ask for.
    #[error("backend terminated by signal")]
    BackendTerminated {
        /// Captured stderr, truncated.
        stderr: String,
    },

    /// The backend ran past its deadline and was killed.
    #[error("backend timed out")]
    BackendTimeout,

    /// The consumer went away and the backend was killed.
    #[error("backend cancelled")]
    Cancelled,

    /// Spool failure while buffering process output.
    #[error(transparent)]
    Spool(#[from] SpoolError),

    /// I/O error talking to the process.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PipeError {
    /// Captured stderr carried by the error, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::BackendFailure { stderr, .. } | Self::BackendTerminated { stderr } => {
                Some(stderr.as_str())
            }
            _ => None,
        }
    }
}
