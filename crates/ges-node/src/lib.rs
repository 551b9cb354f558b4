//! # Ges Node
//!
//! HTTP gateway that serves every git repository below a directory over
//! the smart and dumb HTTP protocols.
//!
//! ## Request flow
//!
//! ```text
//!  request ──► request id / trace layers
//!                 │
//!                 ▼
//!          RouteSelector  (strip decorative prefix, match rule, pick method)
//!                 │
//!                 ▼
//!          AccessPolicy   (read / write)
//!                 │
//!     ┌───────────┼──────────────┬──────────────┐
//!     ▼           ▼              ▼              ▼
//!  InfoRefs   ServiceRpc     StaticFile      Listing
//!     │           │              │
//!     └─► backend tool via ges-pipe (spooled stdin/stdout)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ges --path-prefix /srv/git --repo-uri-marker hub --auto-create
//! git clone http://127.0.0.1:8080/anything/hub/project.git
//! ```
//!
//! ## Modules
//!
//! - [`config`] - Layered gateway configuration
//! - [`selector`] - Regex route table with marker stripping
//! - [`handlers`] - Smart, dumb and listing handlers
//! - [`access`] - Access policy hook
//! - [`server`] - Shared state, dispatch and HTTP serving
//! - [`observability`] - Logging and request IDs

pub mod access;
mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod selector;
pub mod server;
mod watchdog;

pub use access::{AccessPolicy, AccessRequest, AllowAll, Operation, ReadOnly};
pub use config::{ConfigError, GatewayConfig};
pub use error::{GatewayError, Result};
pub use server::Gateway;
