//! URL route selection.
//!
//! A [`RouteSelector`] holds an ordered list of regex rules, each with a
//! table of HTTP methods to handlers. Selection first strips the
//! decorative prefix (everything up to and including the first path
//! segment equal to the configured marker), then tries the rules in
//! registration order against the remainder. The first rule whose pattern
//! matches decides the outcome: its handler for the request method, or a
//! method-not-allowed error listing what it does accept.
//!
//! Patterns are anchored at the start of the remainder. Add a trailing `$`
//! to anchor the end as well.

use axum::http::Method;
use regex::Regex;
use std::collections::HashMap;

/// Why no handler was selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    /// No rule pattern matched, or the marker is absent.
    NotFound(String),
    /// The first matching rule has no handler for the method.
    MethodNotAllowed {
        /// Methods registered on that rule, in registration order.
        allowed: Vec<Method>,
    },
}

struct Rule<H> {
    pattern: Regex,
    handlers: Vec<(Method, H)>,
}

/// Result of a successful selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a, H> {
    /// Handler registered for the method.
    pub handler: &'a H,
    /// Path portion before the marker, without trailing slash. Empty when
    /// no marker is configured.
    pub decorative_path: String,
    /// Remainder after the marker, without its leading slash.
    pub working_path: String,
    /// Named captures that participated in the match.
    pub captures: HashMap<String, String>,
}

/// Ordered regex router with method tables and marker stripping.
pub struct RouteSelector<H> {
    marker: Option<String>,
    rules: Vec<Rule<H>>,
}

impl<H> RouteSelector<H> {
    /// Creates an empty selector. An empty or missing marker disables
    /// prefix stripping.
    pub fn new(marker: Option<&str>) -> Self {
        Self {
            marker: marker.filter(|m| !m.is_empty()).map(str::to_string),
            rules: Vec::new(),
        }
    }

    /// Appends a rule. Earlier rules win over later ones.
    pub fn add<I>(&mut self, pattern: &str, handlers: I) -> Result<&mut Self, regex::Error>
    where
        I: IntoIterator<Item = (Method, H)>,
    {
        let pattern = Regex::new(&format!("^(?:{pattern})"))?;
        self.rules.push(Rule {
            pattern,
            handlers: handlers.into_iter().collect(),
        });
        Ok(self)
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Splits `path` at the marker into the decorative prefix and the
    /// remainder (always starting with `/`). Returns `None` when a marker
    /// is configured but absent from the path.
    pub fn strip_marker(&self, path: &str) -> Option<(String, String)> {
        let Some(marker) = self.marker.as_deref() else {
            let rest = if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            };
            return Some((String::new(), rest));
        };

        let segments: Vec<&str> = path.split('/').collect();
        let index = segments.iter().position(|segment| *segment == marker)?;
        let decorative = segments[..index].join("/");
        let rest = format!("/{}", segments[index + 1..].join("/"));
        Some((decorative, rest))
    }

    /// Picks the handler for `method` and `path`.
    pub fn select(&self, method: &Method, path: &str) -> Result<RouteMatch<'_, H>, SelectError> {
        let (decorative_path, rest) = self
            .strip_marker(path)
            .ok_or_else(|| SelectError::NotFound(path.to_string()))?;

        let rule = self
            .rules
            .iter()
            .find(|rule| rule.pattern.is_match(&rest))
            .ok_or_else(|| SelectError::NotFound(path.to_string()))?;

        let Some((_, handler)) = rule.handlers.iter().find(|(m, _)| m == method) else {
            return Err(SelectError::MethodNotAllowed {
                allowed: rule.handlers.iter().map(|(m, _)| m.clone()).collect(),
            });
        };

        let mut captures = HashMap::new();
        if let Some(caps) = rule.pattern.captures(&rest) {
            for name in rule.pattern.capture_names().flatten() {
                if let Some(value) = caps.name(name) {
                    captures.insert(name.to_string(), value.as_str().to_string());
                }
            }
        }

        Ok(RouteMatch {
            handler,
            decorative_path,
            working_path: rest.trim_start_matches('/').to_string(),
            captures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn selector(marker: Option<&str>) -> RouteSelector<&'static str> {
        let mut selector = RouteSelector::new(marker);
        selector
            .add("/a/(?P<x>.*)", [(Method::GET, "h1")])
            .unwrap()
            .add("/(?P<y>.*)", [(Method::GET, "h2"), (Method::POST, "h2-post")])
            .unwrap();
        selector
    }

    #[test]
    fn first_matching_rule_wins() {
        let selector = selector(None);

        let m = selector.select(&Method::GET, "/a/b").unwrap();
        assert_eq!(*m.handler, "h1");
        assert_eq!(m.captures["x"], "b");
        assert!(!m.captures.contains_key("y"));

        let m = selector.select(&Method::GET, "/c").unwrap();
        assert_eq!(*m.handler, "h2");
        assert_eq!(m.captures["y"], "c");
    }

    #[test]
    fn method_mismatch_is_not_a_miss() {
        let selector = selector(None);
        assert_eq!(
            selector.select(&Method::DELETE, "/a/b"),
            Err(SelectError::MethodNotAllowed {
                allowed: vec![Method::GET]
            })
        );
        // The earlier path match decides even though a later rule has POST.
        assert!(matches!(
            selector.select(&Method::POST, "/a/b"),
            Err(SelectError::MethodNotAllowed { .. })
        ));
    }

    #[test]
    fn no_rule_is_not_found() {
        let mut selector = RouteSelector::new(None);
        selector.add("/only$", [(Method::GET, ())]).unwrap();
        assert_eq!(
            selector.select(&Method::GET, "/other"),
            Err(SelectError::NotFound("/other".into()))
        );
    }

    #[test]
    fn patterns_are_anchored_at_start() {
        let selector = selector(None);
        let m = selector.select(&Method::GET, "/b/a/c").unwrap();
        assert_eq!(*m.handler, "h2");
    }

    #[test]
    fn marker_strips_decorative_prefix() {
        let selector = selector(Some("hub"));

        let m = selector.select(&Method::GET, "/x/y/hub/repo.git/HEAD").unwrap();
        assert_eq!(m.decorative_path, "/x/y");
        assert_eq!(m.working_path, "repo.git/HEAD");

        let m = selector.select(&Method::GET, "/hub/repo.git/HEAD").unwrap();
        assert_eq!(m.decorative_path, "");
        assert_eq!(m.working_path, "repo.git/HEAD");
    }

    #[test]
    fn marker_must_be_a_whole_segment() {
        let selector = selector(Some("hub"));
        assert!(matches!(
            selector.select(&Method::GET, "/github/repo.git"),
            Err(SelectError::NotFound(_))
        ));
        assert!(matches!(
            selector.select(&Method::GET, "/repo.git/HEAD"),
            Err(SelectError::NotFound(_))
        ));
    }

    #[test]
    fn first_marker_occurrence_is_used() {
        let selector = selector(Some("hub"));
        let m = selector.select(&Method::GET, "/hub/hub/repo.git").unwrap();
        assert_eq!(m.working_path, "hub/repo.git");
    }

    #[test]
    fn bad_pattern_is_reported() {
        let mut selector: RouteSelector<()> = RouteSelector::new(None);
        assert!(selector.add("/(unclosed", []).is_err());
        assert!(selector.is_empty());
    }

    proptest! {
        #[test]
        fn prop_selection_is_deterministic(path in "/[a-z/]{0,20}") {
            let selector = selector(None);
            let first = selector.select(&Method::GET, &path);
            let second = selector.select(&Method::GET, &path);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_decorative_prefix_is_ignored(
            prefix in prop::collection::vec("[a-g]{1,5}", 0..4),
            tail in "[a-z.]{1,10}(/[a-z.]{1,10}){0,2}",
        ) {
            let selector = selector(Some("hub"));
            let decorated = format!("/{}/hub/{tail}", prefix.join("/"));
            let bare = format!("/hub/{tail}");
            let a = selector.select(&Method::GET, &decorated).unwrap();
            let b = selector.select(&Method::GET, &bare).unwrap();
            prop_assert_eq!(a.working_path, b.working_path);
            prop_assert_eq!(a.captures, b.captures);
            prop_assert_eq!(a.handler, b.handler);
        }
    }
}
