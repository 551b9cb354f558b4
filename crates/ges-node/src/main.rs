//! Ges - git smart and dumb HTTP gateway.

use anyhow::Context;
use clap::Parser;
use ges_node::config::GatewayConfig;
use ges_node::observability::{init_logging, LogFormat};
use ges_node::server::{serve, shutdown_signal};
use ges_node::Gateway;
use std::path::PathBuf;
use tokio::net::TcpListener;

/// Serves every git repository below a directory over HTTP.
///
/// A directory counts as a repository when it holds HEAD, objects/ and
/// refs/, whatever its name. Bare repositories and working-tree .git
/// folders both qualify.
#[derive(Parser, Debug)]
#[command(name = "ges")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory whose contents are served [default: .]
    #[arg(long)]
    path_prefix: Option<PathBuf>,

    /// Path segment separating the decorative URL prefix from the repository
    /// path. Anything may come before it. Empty disables it.
    #[arg(long)]
    repo_uri_marker: Option<String>,

    /// Listen host [default: 127.0.0.1]
    #[arg(long)]
    host: Option<String>,

    /// Listen port [default: 8080]
    #[arg(short, long)]
    port: Option<u16>,

    /// Bytes buffered in memory before spilling to a temp file
    #[arg(long)]
    spillover_threshold: Option<usize>,

    /// Create bare repositories on push to a missing path
    #[arg(long)]
    auto_create: bool,

    /// Executable providing upload-pack and receive-pack [default: git]
    #[arg(long)]
    backend_tool: Option<String>,

    /// Kill backend processes after this many seconds
    #[arg(long)]
    backend_timeout: Option<u64>,

    /// Kill backend processes after this many seconds without I/O
    #[arg(long)]
    backend_idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    fn apply(self, mut config: GatewayConfig) -> GatewayConfig {
        if let Some(v) = self.path_prefix {
            config.path_prefix = v;
        }
        if let Some(v) = self.repo_uri_marker {
            config.repo_uri_marker = v;
        }
        if let Some(v) = self.host {
            config.host = v;
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.spillover_threshold {
            config.spillover_threshold_bytes = v;
        }
        if self.auto_create {
            config.auto_create_on_push = true;
        }
        if let Some(v) = self.backend_tool {
            config.backend_tool_path = v;
        }
        if let Some(v) = self.backend_timeout {
            config.backend_timeout_secs = Some(v);
        }
        if let Some(v) = self.backend_idle_timeout {
            config.backend_idle_timeout_secs = Some(v);
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
        if let Some(v) = self.log_format {
            config.log_format = v;
        }
        config
    }
}

fn banner(config: &GatewayConfig) -> String {
    let (marker, example) = match config.marker() {
        Some(marker) => (
            format!("\"/{marker}/\""),
            format!(
                "http://localhost:{port}/whatever/you/want/here/{marker}/myrepo.git\n    \
                 (\"whatever/you/want/here\" cannot include the \"/{marker}/\" segment)",
                port = config.port
            ),
        ),
        None => (
            "not chosen".to_string(),
            format!("http://localhost:{}/myrepo.git", config.port),
        ),
    };
    format!(
        "\n\
         ===========================================================================\n\
         Starting ges {version}\n\
         \tListening on: {addr}\n\
         \tRepository root: {root}\n\
         \tRepository URI marker: {marker}\n\
         \tAuto-create on push: {auto}\n\
         \n\
         Example repo url:\n    {example}\n\
         \n\
         Press Ctrl+C to stop the server\n\
         ===========================================================================\n",
        version = env!("CARGO_PKG_VERSION"),
        addr = config.listen_addr(),
        root = config.path_prefix.display(),
        auto = config.auto_create_on_push,
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = GatewayConfig::load(args.config.as_deref())?;
    let config = args.apply(config);
    let format: LogFormat = config.log_format.parse().map_err(anyhow::Error::msg)?;
    init_logging(&config.log_level, format);

    let config = config.validate()?;
    tracing::info!(
        root = %config.path_prefix.display(),
        marker = config.marker().unwrap_or(""),
        auto_create = config.auto_create_on_push,
        backend = %config.backend_tool_path,
        spillover_threshold = config.spillover_threshold_bytes,
        "Gateway configuration"
    );

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    eprintln!("{}", banner(&config));

    let router = Gateway::new(config)
        .context("failed to build route table")?
        .into_router();
    serve(listener, router, shutdown_signal()).await?;

    tracing::info!("Server stopped");
    Ok(())
}
