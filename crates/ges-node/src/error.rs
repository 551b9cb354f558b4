//! Gateway error types and their HTTP mapping.

use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use ges_git::GitError;
use ges_pipe::{PipeError, SpoolError};
use ges_repo::RepoError;
use thiserror::Error;

use crate::selector::SelectError;

/// Seconds a client should wait before retrying after a creation race.
const RETRY_AFTER_SECS: &str = "1";

/// Errors that can end a gateway request.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No route pattern matched the path.
    #[error("not found: {0}")]
    RouteNotFound(String),

    /// A route matched the path but not the method.
    #[error("method not allowed")]
    MethodNotAllowed {
        /// Methods the matching route accepts.
        allowed: Vec<Method>,
    },

    /// No repository at the working path.
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// A dumb protocol file is missing from an existing repository.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Another request is creating the same repository.
    #[error("repository is being created, retry: {0}")]
    RepositoryCreationConflict(String),

    /// The working path leaves the served root.
    #[error("path rejected: {0}")]
    PathTraversalRejected(String),

    /// `service=` names something other than upload-pack or receive-pack.
    #[error("unsupported service: {0}")]
    UnsupportedService(String),

    /// POST body carries the wrong content type.
    #[error("unsupported media type, expected {expected}")]
    UnsupportedMediaType {
        /// Content type the service requires.
        expected: &'static str,
    },

    /// The access policy refused the request.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The request body could not be decoded.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The backend tool could not be started.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend failed before producing a response.
    #[error("backend failed with status {code}: {stderr}")]
    BackendFailure {
        /// Exit status.
        code: i32,
        /// Captured stderr.
        stderr: String,
    },

    /// The backend was killed by a signal.
    #[error("backend terminated: {0}")]
    BackendTerminated(String),

    /// The backend ran too long.
    #[error("backend timed out")]
    BackendTimeout,

    /// Local I/O failure, including spool storage.
    #[error("I/O failure: {0}")]
    Io(String),

    /// Anything else that should never reach a client in detail.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound(_) | Self::RepositoryNotFound(_) | Self::FileNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::RepositoryCreationConflict(_) => StatusCode::CONFLICT,
            Self::PathTraversalRejected(_) | Self::UnsupportedService(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BackendUnavailable(_)
            | Self::BackendFailure { .. }
            | Self::BackendTerminated(_) => StatusCode::BAD_GATEWAY,
            Self::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Io(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }

        let mut response = (status, format!("{self}\n")).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        match &self {
            Self::MethodNotAllowed { allowed } => {
                let allow = allowed
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                if let Ok(value) = HeaderValue::from_str(&allow) {
                    headers.insert(header::ALLOW, value);
                }
            }
            Self::RepositoryCreationConflict(_) => {
                headers.insert(
                    header::RETRY_AFTER,
                    HeaderValue::from_static(RETRY_AFTER_SECS),
                );
            }
            _ => {}
        }
        response
    }
}

impl From<SelectError> for GatewayError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::NotFound(path) => Self::RouteNotFound(path),
            SelectError::MethodNotAllowed { allowed } => Self::MethodNotAllowed { allowed },
        }
    }
}

impl From<RepoError> for GatewayError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(path) => Self::RepositoryNotFound(path),
            RepoError::PathTraversal(path) => Self::PathTraversalRejected(path),
            RepoError::CreationConflict(path) => Self::RepositoryCreationConflict(path),
            RepoError::Io(e) => Self::Io(e.to_string()),
        }
    }
}

impl From<PipeError> for GatewayError {
    fn from(err: PipeError) -> Self {
        match err {
            PipeError::BackendUnavailable { program, source } => {
                Self::BackendUnavailable(format!("{program}: {source}"))
            }
            PipeError::BackendFailure { code, stderr } => Self::BackendFailure {
                code,
                stderr: stderr.trim().to_string(),
            },
            PipeError::BackendTerminated { stderr } => {
                Self::BackendTerminated(stderr.trim().to_string())
            }
            PipeError::BackendTimeout => Self::BackendTimeout,
            PipeError::Cancelled => Self::Internal("backend cancelled".to_string()),
            PipeError::Spool(e) => e.into(),
            PipeError::Io(e) => Self::Io(e.to_string()),
        }
    }
}

impl From<SpoolError> for GatewayError {
    fn from(err: SpoolError) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<GitError> for GatewayError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::UnknownService(name) => Self::UnsupportedService(name),
            other => Self::Internal(other.to_string()),
        }
    }
}
