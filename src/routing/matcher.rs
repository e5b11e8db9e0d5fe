//! Route matching logic.
//!
//! # Responsibilities
//! - Match host (exact or `*.suffix` wildcard, case-insensitive)
//! - Match path (exact or prefix, case-sensitive)
//! - Combine conditions with AND semantics
//! - Rank matchers by specificity
//!
//! # Design Decisions
//! - Host matching is case-insensitive (RFC 9110), ports are ignored
//! - Path matching is case-sensitive
//! - Missing host condition = any host
//! - No regex to guarantee O(n) matching

use std::cmp::Ordering;

/// Host condition of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMatcher {
    Any,
    /// `*.example.com`, stored as `.example.com`.
    Suffix(String),
    Exact(String),
}

impl HostMatcher {
    /// Parse a configured host pattern. A port in the pattern is ignored,
    /// as it is on request hosts.
    pub fn parse(pattern: Option<&str>) -> Self {
        match pattern.map(str::trim) {
            None | Some("") | Some("*") => HostMatcher::Any,
            Some(p) => {
                let host = normalize_host(p);
                match host.strip_prefix('*') {
                    Some(suffix) => HostMatcher::Suffix(suffix.to_string()),
                    None => HostMatcher::Exact(host),
                }
            }
        }
    }

    /// `host` must already be normalized with [`normalize_host`].
    pub fn matches(&self, host: Option<&str>) -> bool {
        match self {
            HostMatcher::Any => true,
            HostMatcher::Suffix(suffix) => host
                .map(|h| h.len() > suffix.len() && h.ends_with(suffix.as_str()))
                .unwrap_or(false),
            HostMatcher::Exact(expected) => host == Some(expected.as_str()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            HostMatcher::Any => 0,
            HostMatcher::Suffix(_) => 1,
            HostMatcher::Exact(_) => 2,
        }
    }

    fn literal_len(&self) -> usize {
        match self {
            HostMatcher::Any => 0,
            HostMatcher::Suffix(s) | HostMatcher::Exact(s) => s.len(),
        }
    }
}

/// Path condition of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatcher {
    /// `/v1/*`, stored as `/v1/`.
    Prefix(String),
    Exact(String),
}

impl PathMatcher {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => PathMatcher::Prefix(prefix.to_string()),
            None => PathMatcher::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathMatcher::Exact(expected) => path == expected,
        }
    }
}

/// Ordering key: a greater value is more specific.
///
/// Host class dominates (exact > wildcard > any), then an exact path beats a
/// prefix, then the longer literal wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    host_rank: u8,
    host_len: usize,
    path_exact: bool,
    path_len: usize,
}

/// Host AND path condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatcher {
    pub host: HostMatcher,
    pub path: PathMatcher,
}

impl RouteMatcher {
    pub fn new(host: Option<&str>, path: &str) -> Self {
        Self {
            host: HostMatcher::parse(host),
            path: PathMatcher::parse(path),
        }
    }

    pub fn matches(&self, host: Option<&str>, path: &str) -> bool {
        self.host.matches(host) && self.path.matches(path)
    }

    pub fn specificity(&self) -> Specificity {
        let (path_exact, path_len) = match &self.path {
            PathMatcher::Exact(p) => (true, p.len()),
            PathMatcher::Prefix(p) => (false, p.len()),
        };
        Specificity {
            host_rank: self.host.rank(),
            host_len: self.host.literal_len(),
            path_exact,
            path_len,
        }
    }

    /// Most specific first.
    pub fn cmp_specificity(&self, other: &Self) -> Ordering {
        other.specificity().cmp(&self.specificity())
    }
}

/// Lowercase the host and drop any port.
pub fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();
    let host = if raw.starts_with('[') {
        // IPv6 literal: keep the brackets, drop the port.
        raw.split_once(']')
            .map(|(addr, _)| &raw[..addr.len() + 1])
            .unwrap_or(raw)
    } else {
        raw.rsplit_once(':').map(|(h, _)| h).unwrap_or(raw)
    };
    host.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::parse(Some("Example.com"));
        assert!(matcher.matches(Some("example.com")));
        assert!(!matcher.matches(Some("other.com")));
        assert!(!matcher.matches(None));

        let wildcard = HostMatcher::parse(Some("*.example.com"));
        assert!(wildcard.matches(Some("api.example.com")));
        assert!(!wildcard.matches(Some("example.com")));

        let with_port = HostMatcher::parse(Some("API.example.com:8443"));
        assert_eq!(with_port, HostMatcher::Exact("api.example.com".into()));
        assert!(with_port.matches(Some(normalize_host("api.example.com:8443").as_str())));
        assert_eq!(
            HostMatcher::parse(Some("*.example.com:443")),
            HostMatcher::Suffix(".example.com".into())
        );

        assert_eq!(HostMatcher::parse(Some("*")), HostMatcher::Any);
        assert!(HostMatcher::parse(None).matches(None));
    }

    #[test]
    fn test_path_matcher() {
        let prefix = PathMatcher::parse("/api/*");
        assert!(prefix.matches("/api/v1"));
        assert!(prefix.matches("/api/"));
        assert!(!prefix.matches("/api"));
        assert!(!prefix.matches("/images"));

        let exact = PathMatcher::parse("/health");
        assert!(exact.matches("/health"));
        assert!(!exact.matches("/health/deep"));
    }

    #[test]
    fn test_specificity_order() {
        let exact_host = RouteMatcher::new(Some("api.example.com"), "/*");
        let wildcard_host = RouteMatcher::new(Some("*.example.com"), "/v1/users");
        let any_long = RouteMatcher::new(None, "/v1/users/*");
        let any_exact = RouteMatcher::new(None, "/v1/users/");
        let any_short = RouteMatcher::new(None, "/v1/*");

        assert!(exact_host.specificity() > wildcard_host.specificity());
        assert!(wildcard_host.specificity() > any_long.specificity());
        assert!(any_exact.specificity() > any_long.specificity());
        assert!(any_long.specificity() > any_short.specificity());
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("API.example.com:8443"), "api.example.com");
        assert_eq!(normalize_host("example.com"), "example.com");
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
    }
}
