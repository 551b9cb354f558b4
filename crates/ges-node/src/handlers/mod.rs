//! Protocol handlers and the route table that selects them.

pub mod dumb;
pub mod listing;
pub mod smart;
mod upload;

use axum::extract::{Query, Request};
use axum::http::{Method, Uri};
use axum::response::Response;
use ges_git::Service;
use serde::Deserialize;
use std::collections::HashMap;

use crate::access::Operation;
use crate::error::{GatewayError, Result};
use crate::selector::{RouteMatch, RouteSelector};
use crate::server::Gateway;

/// Optional repository prefix in front of the protocol suffix.
const REPO: &str = r"(?:(?P<repo>.*?)/)?";

/// Dumb protocol files, relative to the repository directory.
const DUMB_FILES: &str = concat!(
    r"HEAD",
    r"|objects/info/(?:packs|alternates|http-alternates)",
    r"|objects/[0-9a-f]{2}/[0-9a-f]{38}",
    r"|objects/pack/pack-[0-9a-f]{40}\.(?:pack|idx)",
    r"|packed-refs",
);

/// Which handler serves a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// `GET .../info/refs`, smart with `?service=`, dumb without. `POST`
    /// is accepted for the smart form only.
    InfoRefs,
    /// `POST .../git-upload-pack` and `POST .../git-receive-pack`.
    ServiceRpc,
    /// Dumb protocol file downloads.
    StaticFile,
    /// Plain-text directory listing.
    Listing,
}

/// Owned copy of a [`RouteMatch`] that outlives the selector borrow.
#[derive(Debug, Clone)]
pub struct RouteParams {
    /// Path portion before the marker.
    pub decorative_path: String,
    /// Path after the marker, without leading slash.
    pub working_path: String,
    captures: HashMap<String, String>,
}

impl<H> From<RouteMatch<'_, H>> for RouteParams {
    fn from(route: RouteMatch<'_, H>) -> Self {
        Self {
            decorative_path: route.decorative_path,
            working_path: route.working_path,
            captures: route.captures,
        }
    }
}

impl RouteParams {
    /// A named capture, if it took part in the match.
    pub fn capture(&self, name: &str) -> Option<&str> {
        self.captures.get(name).map(String::as_str)
    }

    /// The repository part of the working path (empty for the root).
    pub fn repo(&self) -> &str {
        self.capture("repo").unwrap_or("")
    }
}

#[derive(Debug, Default, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

/// The `service` query parameter, if present.
pub(crate) fn service_param(uri: &Uri) -> Option<String> {
    Query::<InfoRefsQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(query)| query.service)
}

/// Builds the gateway route table. Order matters: protocol suffixes are
/// tried before the listing catch-all.
pub fn default_routes(
    marker: Option<&str>,
) -> std::result::Result<RouteSelector<Handler>, regex::Error> {
    let mut routes = RouteSelector::new(marker);
    routes
        .add(
            &format!("/{REPO}info/refs$"),
            [
                (Method::GET, Handler::InfoRefs),
                (Method::HEAD, Handler::InfoRefs),
                (Method::POST, Handler::InfoRefs),
            ],
        )?
        .add(
            &format!("/{REPO}(?P<service>git-upload-pack|git-receive-pack)$"),
            [(Method::POST, Handler::ServiceRpc)],
        )?
        .add(
            &format!("/{REPO}(?P<file>{DUMB_FILES})$"),
            [(Method::GET, Handler::StaticFile), (Method::HEAD, Handler::StaticFile)],
        )?
        .add(
            "/(?P<repo>.*)$",
            [(Method::GET, Handler::Listing), (Method::HEAD, Handler::Listing)],
        )?;
    Ok(routes)
}

impl Handler {
    /// Whether the request reads or writes.
    pub fn operation(&self, params: &RouteParams, uri: &Uri) -> Operation {
        let service = match self {
            Self::ServiceRpc => params.capture("service").map(str::to_string),
            Self::InfoRefs => service_param(uri),
            Self::StaticFile | Self::Listing => None,
        };
        match service.as_deref().and_then(|s| s.parse::<Service>().ok()) {
            Some(service) if service.is_write() => Operation::Write,
            _ => Operation::Read,
        }
    }

    /// Runs the handler.
    pub async fn handle(
        self,
        gateway: &Gateway,
        params: RouteParams,
        request: Request,
    ) -> Result<Response> {
        match self {
            Self::InfoRefs => match service_param(request.uri()) {
                Some(service) => {
                    let service = service.parse::<Service>()?;
                    smart::advertise_refs(gateway, &params, service).await
                }
                None if request.method() == Method::POST => Err(GatewayError::MethodNotAllowed {
                    allowed: vec![Method::GET, Method::HEAD],
                }),
                None => dumb::serve_file(gateway, params.repo(), "info/refs", request).await,
            },
            Self::ServiceRpc => smart::service_rpc(gateway, &params, request).await,
            Self::StaticFile => {
                let file = params
                    .capture("file")
                    .ok_or_else(|| GatewayError::RouteNotFound(params.working_path.clone()))?;
                dumb::serve_file(gateway, params.repo(), file, request).await
            }
            Self::Listing => listing::list(gateway, &params).await,
        }
    }
}

/// Runs a blocking repository operation off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> ges_repo::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GatewayError::Internal(format!("repository task failed: {e}")))?
        .map_err(GatewayError::from)
}
