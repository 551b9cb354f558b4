//! Plain-text listing of the served tree.
//!
//! A directory answers with one `<name>\t<repo|dir>` line per visible
//! child directory. A repository answers with a single
//! `<path>\trepo\t<bare|non-bare>` line.

use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use ges_repo::DirEntry;
use std::fmt::Write;

use super::{blocking, RouteParams};
use crate::cache::CacheControl;
use crate::error::Result;
use crate::server::Gateway;

/// `GET` on any path that is not a protocol endpoint.
pub async fn list(gateway: &Gateway, params: &RouteParams) -> Result<Response> {
    let working_path = params.repo().trim_end_matches('/').to_string();
    let locator = gateway.locator().clone();

    let path = working_path.clone();
    let listing = blocking(move || {
        let descriptor = locator.describe(&path)?;
        if descriptor.is_valid {
            return Ok(Listing::Repository {
                is_bare: descriptor.is_bare,
            });
        }
        Ok(Listing::Directory(locator.list(&path)?))
    })
    .await?;

    let body = listing.render(&working_path);
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    CacheControl::NoCache.apply(headers);
    Ok(response)
}

enum Listing {
    Repository { is_bare: bool },
    Directory(Vec<DirEntry>),
}

impl Listing {
    fn render(&self, working_path: &str) -> String {
        let mut out = String::new();
        match self {
            Self::Repository { is_bare } => {
                let name = if working_path.is_empty() { "." } else { working_path };
                let bare = if *is_bare { "bare" } else { "non-bare" };
                let _ = writeln!(out, "{name}\trepo\t{bare}");
            }
            Self::Directory(entries) => {
                for entry in entries {
                    let kind = if entry.is_repository { "repo" } else { "dir" };
                    let _ = writeln!(out, "{}\t{kind}", entry.name);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_directory() {
        let listing = Listing::Directory(vec![
            DirEntry {
                name: "a".into(),
                is_repository: false,
            },
            DirEntry {
                name: "b.git".into(),
                is_repository: true,
            },
        ]);
        assert_eq!(listing.render("group"), "a\tdir\nb.git\trepo\n");
    }

    #[test]
    fn renders_repository() {
        assert_eq!(
            Listing::Repository { is_bare: true }.render("r.git"),
            "r.git\trepo\tbare\n"
        );
        assert_eq!(
            Listing::Repository { is_bare: false }.render(""),
            ".\trepo\tnon-bare\n"
        );
    }

    #[test]
    fn empty_directory_renders_nothing() {
        assert_eq!(Listing::Directory(Vec::new()).render(""), "");
    }
}
