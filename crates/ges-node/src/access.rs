//! Access control hook.
//!
//! The gateway itself performs no authentication. Deployments that need it
//! install an [`AccessPolicy`] which sees every request after routing and
//! may reject it before any repository is touched.

use axum::http::{HeaderMap, Method};

use crate::error::{GatewayError, Result};

/// Kind of operation a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Fetch, clone, listing and dumb file reads.
    Read,
    /// Push (receive-pack), which may also create a repository.
    Write,
}

/// What the policy gets to look at.
#[derive(Debug)]
pub struct AccessRequest<'a> {
    /// Read or write.
    pub operation: Operation,
    /// Request method.
    pub method: &'a Method,
    /// Path after the marker, without leading slash.
    pub working_path: &'a str,
    /// Request headers, e.g. `Authorization`.
    pub headers: &'a HeaderMap,
}

/// Decides whether a request may proceed.
pub trait AccessPolicy: Send + Sync + 'static {
    /// Returns an error (usually [`GatewayError::Forbidden`]) to reject.
    fn check(&self, request: &AccessRequest<'_>) -> Result<()>;
}

/// Lets everything through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check(&self, _request: &AccessRequest<'_>) -> Result<()> {
        Ok(())
    }
}

/// Refuses every write. Handy for public mirrors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnly;

impl AccessPolicy for ReadOnly {
    fn check(&self, request: &AccessRequest<'_>) -> Result<()> {
        match request.operation {
            Operation::Read => Ok(()),
            Operation::Write => Err(GatewayError::Forbidden(format!(
                "push to {} is disabled",
                request.working_path
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(operation: Operation, headers: &HeaderMap) -> AccessRequest<'_> {
        AccessRequest {
            operation,
            method: &Method::POST,
            working_path: "repo.git/git-receive-pack",
            headers,
        }
    }

    #[test]
    fn allow_all_allows() {
        let headers = HeaderMap::new();
        assert!(AllowAll.check(&request(Operation::Write, &headers)).is_ok());
    }

    #[test]
    fn read_only_rejects_writes() {
        let headers = HeaderMap::new();
        assert!(ReadOnly.check(&request(Operation::Read, &headers)).is_ok());
        assert!(matches!(
            ReadOnly.check(&request(Operation::Write, &headers)),
            Err(GatewayError::Forbidden(_))
        ));
    }
}
