//! Git wire error types.

use thiserror::Error;

/// Errors that can occur while handling git wire data.
#[derive(Debug, Error)]
pub enum GitError {
    /// Invalid pkt-line format.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// A `service=` value that is neither upload-pack nor receive-pack.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
