//! Git wire details for the ges gateway.
//!
//! The gateway never parses pack data; the backend tool does that. This
//! crate only knows what the HTTP layer has to know:
//!
//! - the pkt-line framing used for the service announcement,
//! - the two smart services and their content types,
//! - which repository files the dumb protocol may serve and how.

mod error;
mod files;
mod pktline;
mod service;

pub use error::GitError;
pub use files::FileKind;
pub use pktline::{PktLine, PktLineWriter, MAX_PKT_DATA_LEN};
pub use service::{service_announcement, Service};

/// Result type for git wire operations.
pub type Result<T> = std::result::Result<T, GitError>;
