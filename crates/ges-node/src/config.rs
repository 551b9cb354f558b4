//! Gateway configuration.
//!
//! Values are layered with the `config` crate: built-in defaults, then an
//! optional file (format picked from its extension), then `GES_*`
//! environment variables. The binary applies command-line flags last.

use ges_pipe::SpoolConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default spillover threshold: 1 MiB.
pub const DEFAULT_SPILLOVER_THRESHOLD: usize = 1024 * 1024;

/// Errors raised while loading or checking configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The served root could not be resolved.
    #[error("cannot resolve path prefix {path}: {source}")]
    PathPrefix {
        /// The configured value.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Directory tree that holds the served repositories.
    pub path_prefix: PathBuf,
    /// Path segment that ends the decorative URL prefix. Empty disables it.
    pub repo_uri_marker: String,
    /// Bytes a spool keeps in memory before moving to a temp file.
    pub spillover_threshold_bytes: usize,
    /// Create a bare repository when a push targets a missing path.
    pub auto_create_on_push: bool,
    /// Executable providing `upload-pack` and `receive-pack`.
    pub backend_tool_path: String,
    /// Kill a backend that runs longer than this.
    pub backend_timeout_secs: Option<u64>,
    /// Kill a backend after this long without I/O.
    pub backend_idle_timeout_secs: Option<u64>,
    /// Directory for spool files; the system temp dir when unset.
    pub spool_dir: Option<PathBuf>,
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// `pretty` or `json`.
    pub log_format: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            path_prefix: PathBuf::from("."),
            repo_uri_marker: String::new(),
            spillover_threshold_bytes: DEFAULT_SPILLOVER_THRESHOLD,
            auto_create_on_push: false,
            backend_tool_path: "git".to_string(),
            backend_timeout_secs: None,
            backend_idle_timeout_secs: None,
            spool_dir: None,
            host: "127.0.0.1".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Loads defaults, then `file` if given, then `GES_*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("GES").try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Checks value ranges and canonicalizes `path_prefix`.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.repo_uri_marker.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "repo_uri_marker must be a single path segment, got {:?}",
                self.repo_uri_marker
            )));
        }
        if self.spillover_threshold_bytes == 0 {
            return Err(ConfigError::Invalid(
                "spillover_threshold_bytes must be positive".to_string(),
            ));
        }
        if self.backend_tool_path.is_empty() {
            return Err(ConfigError::Invalid(
                "backend_tool_path must not be empty".to_string(),
            ));
        }

        let root = self
            .path_prefix
            .canonicalize()
            .map_err(|source| ConfigError::PathPrefix {
                path: self.path_prefix.clone(),
                source,
            })?;
        if !root.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "path_prefix {} is not a directory",
                root.display()
            )));
        }
        self.path_prefix = root;
        Ok(self)
    }

    /// The marker, or `None` when prefix stripping is disabled.
    pub fn marker(&self) -> Option<&str> {
        Some(self.repo_uri_marker.as_str()).filter(|m| !m.is_empty())
    }

    /// Spool settings for request bodies and backend output.
    pub fn spool_config(&self) -> SpoolConfig {
        SpoolConfig {
            threshold: self.spillover_threshold_bytes,
            dir: self.spool_dir.clone(),
        }
    }

    /// Overall backend deadline.
    pub fn backend_timeout(&self) -> Option<Duration> {
        self.backend_timeout_secs.map(Duration::from_secs)
    }

    /// Backend idle limit.
    pub fn backend_idle_timeout(&self) -> Option<Duration> {
        self.backend_idle_timeout_secs.map(Duration::from_secs)
    }

    /// `host:port` for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
