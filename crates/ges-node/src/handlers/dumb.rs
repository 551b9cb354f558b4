//! Dumb HTTP protocol: plain file downloads out of a repository.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use ges_git::FileKind;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use super::blocking;
use crate::cache::CacheControl;
use crate::error::{GatewayError, Result};
use crate::server::Gateway;

/// Serves `file` (relative to the repository at `repo`). Range and
/// conditional requests are handled by [`ServeFile`].
pub async fn serve_file(
    gateway: &Gateway,
    repo: &str,
    file: &str,
    request: Request,
) -> Result<Response> {
    let kind =
        FileKind::classify(file).ok_or_else(|| GatewayError::FileNotFound(file.to_string()))?;

    let locator = gateway.locator().clone();
    let repo_path = repo.to_string();
    let descriptor = blocking(move || locator.open(&repo_path)).await?;

    let path = descriptor.root_path.join(file);
    if !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
        return Err(GatewayError::FileNotFound(format!("{repo}/{file}")));
    }

    let response = match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    let mut response = response.map(Body::new);

    if matches!(
        response.status(),
        StatusCode::OK | StatusCode::PARTIAL_CONTENT | StatusCode::NOT_MODIFIED
    ) {
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(kind.content_type()),
        );
        CacheControl::for_file(kind.is_immutable()).apply(headers);
    }
    tracing::debug!(
        repo = %repo,
        file = %file,
        status = response.status().as_u16(),
        "Served file"
    );
    Ok(response)
}
