//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up matching route for request
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Entries sorted once, most specific first; ties keep configuration order
//! - O(n) scan (acceptable for typical route counts)
//! - Explicit NoMatch (`None`) rather than silent default

use crate::routing::matcher::RouteMatcher;

#[derive(Debug)]
struct RouteEntry<T> {
    matcher: RouteMatcher,
    value: T,
}

/// Immutable routing table.
#[derive(Debug)]
pub struct Router<T> {
    entries: Vec<RouteEntry<T>>,
}

impl<T> Router<T> {
    /// Build a router from `(matcher, value)` pairs in configuration order.
    pub fn new(routes: impl IntoIterator<Item = (RouteMatcher, T)>) -> Self {
        let mut entries: Vec<RouteEntry<T>> = routes
            .into_iter()
            .map(|(matcher, value)| RouteEntry { matcher, value })
            .collect();

        // Stable sort keeps configuration order between equally specific routes.
        entries.sort_by(|a, b| a.matcher.cmp_specificity(&b.matcher));

        Self { entries }
    }

    /// Find the most specific route for a normalized host and a path.
    pub fn find(&self, host: Option<&str>, path: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|e| e.matcher.matches(host, path))
            .map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Routes in match order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.value)
    }
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(routes: &[(Option<&str>, &str, &'static str)]) -> Router<&'static str> {
        Router::new(
            routes
                .iter()
                .map(|(host, path, name)| (RouteMatcher::new(*host, path), *name)),
        )
    }

    #[test]
    fn test_most_specific_wins() {
        let r = router(&[
            (None, "/*", "catch-all"),
            (None, "/v1/*", "v1"),
            (Some("api.example.com"), "/v1/*", "api-v1"),
            (None, "/v1/health", "health"),
        ]);

        assert_eq!(r.find(Some("api.example.com"), "/v1/users"), Some(&"api-v1"));
        assert_eq!(r.find(Some("other.com"), "/v1/users"), Some(&"v1"));
        assert_eq!(r.find(Some("other.com"), "/v1/health"), Some(&"health"));
        assert_eq!(r.find(None, "/static/app.js"), Some(&"catch-all"));
    }

    #[test]
    fn test_tie_broken_by_config_order() {
        let r = router(&[
            (None, "/v1/*", "first"),
            (None, "/v2/*", "other"),
            (None, "/v1/*", "second"),
        ]);
        for _ in 0..10 {
            assert_eq!(r.find(None, "/v1/x"), Some(&"first"));
        }
    }

    #[test]
    fn test_no_match() {
        let r = router(&[(Some("api.example.com"), "/v1/*", "api")]);
        assert_eq!(r.find(Some("api.example.com"), "/v2/x"), None);
        assert_eq!(r.find(None, "/v1/x"), None);
        assert!(Router::<()>::default().is_empty());
    }
}
