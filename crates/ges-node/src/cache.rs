//! Cache headers for git responses.

use axum::http::{header, HeaderMap, HeaderValue};

/// Cache directives used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheControl {
    /// Content-addressed data that never changes (objects, packs).
    Immutable,
    /// Anything that may change between requests (refs, negotiation).
    NoCache,
}

impl CacheControl {
    /// Converts to a Cache-Control header value.
    pub fn to_header_value(self) -> HeaderValue {
        match self {
            Self::Immutable => HeaderValue::from_static("public, max-age=31536000, immutable"),
            Self::NoCache => HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
        }
    }

    /// Picks the directive for a file of the given mutability.
    pub fn for_file(immutable: bool) -> Self {
        if immutable {
            Self::Immutable
        } else {
            Self::NoCache
        }
    }

    /// Writes the directive plus the legacy headers old proxies honour.
    pub fn apply(self, headers: &mut HeaderMap) {
        headers.insert(header::CACHE_CONTROL, self.to_header_value());
        if self == Self::NoCache {
            headers.insert(
                header::EXPIRES,
                HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"),
            );
            headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        }
    }
}
