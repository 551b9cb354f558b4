//! Repository error types.

use thiserror::Error;

/// Errors that can occur while locating or creating repositories.
#[derive(Debug, Error)]
pub enum RepoError {
    /// Nothing with a repository signature exists at the path.
    #[error("repository not found: {0}")]
    NotFound(String),

    /// The working path resolves outside the served root.
    #[error("path escapes repository root: {0}")]
    PathTraversal(String),

    /// Another request created the repository first.
    #[error("repository is being created concurrently: {0}")]
    CreationConflict(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepoError>;
