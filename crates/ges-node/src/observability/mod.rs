//! Logging and request tracing.

mod logging;
mod middleware;

pub use logging::{init_logging, LogFormat};
pub use middleware::{request_id_middleware, REQUEST_ID_HEADER};
