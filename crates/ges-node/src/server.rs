//! HTTP server: shared gateway state, dispatch and the axum router.

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::{middleware, Router};
use ges_repo::RepositoryLocator;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::access::{AccessPolicy, AccessRequest, AllowAll};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::handlers::{default_routes, Handler, RouteParams};
use crate::observability::request_id_middleware;
use crate::selector::RouteSelector;

/// Everything a request needs, shared read-only by all requests.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    locator: RepositoryLocator,
    routes: RouteSelector<Handler>,
    policy: Arc<dyn AccessPolicy>,
}

impl Gateway {
    /// Builds the gateway from a validated configuration.
    pub fn new(config: GatewayConfig) -> std::result::Result<Self, regex::Error> {
        let routes = default_routes(config.marker())?;
        Ok(Self {
            locator: RepositoryLocator::new(config.path_prefix.clone()),
            config: Arc::new(config),
            routes,
            policy: Arc::new(AllowAll),
        })
    }

    /// Replaces the access policy.
    pub fn with_policy(mut self, policy: impl AccessPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The repository locator for the served root.
    pub fn locator(&self) -> &RepositoryLocator {
        &self.locator
    }

    /// Routes, authorizes and runs one request.
    pub async fn dispatch(&self, request: Request) -> Result<Response> {
        let (handler, params) = {
            let route = self.routes.select(request.method(), request.uri().path())?;
            (*route.handler, RouteParams::from(route))
        };

        let operation = handler.operation(&params, request.uri());
        self.policy.check(&AccessRequest {
            operation,
            method: request.method(),
            working_path: &params.working_path,
            headers: request.headers(),
        })?;

        tracing::debug!(
            handler = ?handler,
            operation = ?operation,
            working_path = %params.working_path,
            "Dispatching"
        );
        handler.handle(self, params, request).await
    }

    /// Wraps the gateway in an axum router with request tracing.
    pub fn into_router(self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(Arc::new(self))
            .layer(middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
    }
}

async fn dispatch(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    match gateway.dispatch(request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Serves `router` on `listener` until `shutdown` resolves, then lets
/// in-flight requests finish.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining connections");
}
