//! Bounded-memory plumbing between HTTP bodies and backend processes.
//!
//! Two pieces live here:
//!
//! - [`spool`]: a byte queue that stays in memory up to a threshold and
//!   continues in a temporary file afterwards. Readers start from the first
//!   byte and may run concurrently with the writer.
//! - [`subprocess`]: spawns a child process and drains its stdout/stderr
//!   into spools on dedicated tasks while a third task feeds stdin, so a
//!   full OS pipe never blocks the child or the caller.

#![forbid(unsafe_code)]

mod error;
pub mod spool;
pub mod subprocess;

pub use error::{PipeError, SpoolError};
pub use spool::{Spool, SpoolConfig, SpoolReader, SpoolWriter};
pub use subprocess::{
    CancelReason, Canceller, ExitOutcome, ExitReport, IdleProbe, PipeCommand, StdinSource,
    Subprocess,
};

/// Result type for spool operations.
pub type SpoolResult<T> = std::result::Result<T, SpoolError>;

/// Result type for subprocess operations.
pub type Result<T> = std::result::Result<T, PipeError>;
