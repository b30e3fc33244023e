/// Normalized URL tuple used by the matcher, the referrer validator and the
/// forwarder. Every textual representation the proxy accepts collapses into
/// this one shape so downstream components never reparse strings.
///
/// Missing components are the explicit wildcard `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    /// URL scheme, lowercased, without a trailing colon
    pub protocol: String,

    /// Host name, lowercased
    pub host: String,

    /// Port as written, or `*` when unspecified
    pub port: String,

    /// Path starting with `/`, case preserved, or `*` when absent
    pub path: String,

    /// Raw query string without the leading `?`, or `*` when absent
    pub query: String,
}

impl UrlParts {
    /// The all-wildcard tuple
    pub fn wildcard() -> Self {
        Self {
            protocol: "*".to_string(),
            host: "*".to_string(),
            port: "*".to_string(),
            path: "*".to_string(),
            query: "*".to_string(),
        }
    }

    /// Parse a standard URL (`scheme://host[:port]/path?query`), a bare
    /// referrer string (`host.example/path`) or a wildcard pattern
    /// (`*.example.com/*`).
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == "*" {
            return Self::wildcard();
        }

        // Split off the query first; everything after the first '?' is opaque.
        let (rest, query) = match raw.find('?') {
            Some(idx) => (&raw[..idx], &raw[idx + 1..]),
            None => (raw, ""),
        };

        // Extract the scheme. A trailing ':' on the scheme (inputs such as
        // `https:/host/path`, produced by collapsed double slashes) is
        // stripped.
        let (protocol, rest) = if let Some(idx) = rest.find("://") {
            (rest[..idx].to_ascii_lowercase(), &rest[idx + 3..])
        } else {
            let first_segment = rest.split('/').next().unwrap_or("");
            if let Some(scheme) = first_segment.strip_suffix(':') {
                let remainder = rest[first_segment.len()..].trim_start_matches('/');
                (scheme.to_ascii_lowercase(), remainder)
            } else {
                ("*".to_string(), rest)
            }
        };

        // Authority / path split.
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let (mut host, mut port) = split_host_port(authority);
        let mut path = path.to_string();

        // An empty host with a non-empty path happens for proxy tails such
        // as `/tiles.example.com/ArcGIS/...`; the first path segment is
        // promoted to the host.
        if host.is_empty() && !path.is_empty() {
            let trimmed = path.trim_start_matches('/');
            let (promoted, remainder) = match trimmed.find('/') {
                Some(idx) => (&trimmed[..idx], trimmed[idx..].to_string()),
                None => (trimmed, String::new()),
            };
            let (promoted_host, promoted_port) = split_host_port(promoted);
            host = promoted_host;
            port = promoted_port;
            path = remainder;
        }

        Self {
            protocol: or_wildcard(protocol),
            host: or_wildcard(host),
            port: or_wildcard(port),
            path: or_wildcard(path),
            query: or_wildcard(query.to_string()),
        }
    }

    /// Parse the tail of a proxy-addressed path. The tail may encode the
    /// target scheme as a leading `http/`, `https/` or `*/` segment, a
    /// convention that survives HTTP clients refusing `://` inside a path;
    /// otherwise it is handled like any other URL string.
    pub fn from_proxy_tail(tail: &str) -> Self {
        let tail = tail.trim();
        for (prefix, scheme) in [("http/", "http"), ("https/", "https"), ("*/", "*")] {
            if let Some(rest) = tail.strip_prefix(prefix) {
                let mut parts = Self::parse(rest);
                parts.protocol = scheme.to_string();
                return parts;
            }
        }
        Self::parse(tail)
    }

    /// True when no usable target host was recovered
    pub fn has_host(&self) -> bool {
        self.host != "*" && !self.host.is_empty()
    }

    /// Query string with `*` mapped back to empty
    pub fn query_or_empty(&self) -> &str {
        if self.query == "*" {
            ""
        } else {
            &self.query
        }
    }

    /// Path with `*` mapped back to `/`
    pub fn path_or_root(&self) -> &str {
        if self.path == "*" {
            "/"
        } else {
            &self.path
        }
    }
}

impl std::fmt::Display for UrlParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.host)?;
        if self.port != "*" {
            write!(f, ":{}", self.port)?;
        }
        if self.path != "*" {
            write!(f, "{}", self.path)?;
        }
        if self.query != "*" {
            write!(f, "?{}", self.query)?;
        }
        Ok(())
    }
}

/// Split `host[:port]`, keeping the colon only when the suffix is numeric
/// (wildcard ports like `host:*` are also recognized).
fn split_host_port(authority: &str) -> (String, String) {
    if let Some(idx) = authority.rfind(':') {
        let candidate = &authority[idx + 1..];
        if candidate == "*" || (!candidate.is_empty() && candidate.bytes().all(|b| b.is_ascii_digit())) {
            return (
                authority[..idx].to_ascii_lowercase(),
                candidate.to_string(),
            );
        }
    }
    (authority.to_ascii_lowercase(), String::new())
}

fn or_wildcard(value: String) -> String {
    if value.is_empty() {
        "*".to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_url() {
        let parts = UrlParts::parse("http://tiles.example.com:8080/ArcGIS/rest/services?f=json");
        assert_eq!(parts.protocol, "http");
        assert_eq!(parts.host, "tiles.example.com");
        assert_eq!(parts.port, "8080");
        assert_eq!(parts.path, "/ArcGIS/rest/services");
        assert_eq!(parts.query, "f=json");
    }

    #[test]
    fn test_parse_defaults_to_wildcards() {
        let parts = UrlParts::parse("https://maps.example.org");
        assert_eq!(parts.protocol, "https");
        assert_eq!(parts.host, "maps.example.org");
        assert_eq!(parts.port, "*");
        assert_eq!(parts.path, "*");
        assert_eq!(parts.query, "*");
    }

    #[test]
    fn test_parse_bare_referrer() {
        let parts = UrlParts::parse("host.example/app/index.html");
        assert_eq!(parts.protocol, "*");
        assert_eq!(parts.host, "host.example");
        assert_eq!(parts.path, "/app/index.html");
    }

    #[test]
    fn test_parse_wildcard_pattern() {
        let parts = UrlParts::parse("*.example.com/*");
        assert_eq!(parts.protocol, "*");
        assert_eq!(parts.host, "*.example.com");
        assert_eq!(parts.path, "/*");
    }

    #[test]
    fn test_parse_strips_trailing_scheme_colon() {
        let parts = UrlParts::parse("https:/maps.example.org/base");
        assert_eq!(parts.protocol, "https");
        assert_eq!(parts.host, "maps.example.org");
        assert_eq!(parts.path, "/base");
    }

    #[test]
    fn test_host_promotion_from_path() {
        let parts = UrlParts::parse("/tiles.example.com/ArcGIS/rest");
        assert_eq!(parts.host, "tiles.example.com");
        assert_eq!(parts.path, "/ArcGIS/rest");
    }

    #[test]
    fn test_host_promotion_carries_port() {
        let parts = UrlParts::parse("/tiles.example.com:6080/ArcGIS");
        assert_eq!(parts.host, "tiles.example.com");
        assert_eq!(parts.port, "6080");
        assert_eq!(parts.path, "/ArcGIS");
    }

    #[test]
    fn test_tail_with_encoded_scheme() {
        let parts = UrlParts::from_proxy_tail("https/secure.example.com/ArcGIS/rest");
        assert_eq!(parts.protocol, "https");
        assert_eq!(parts.host, "secure.example.com");
        assert_eq!(parts.path, "/ArcGIS/rest");

        let parts = UrlParts::from_proxy_tail("*/any.example.com/service");
        assert_eq!(parts.protocol, "*");
        assert_eq!(parts.host, "any.example.com");
    }

    #[test]
    fn test_tail_with_full_url() {
        let parts = UrlParts::from_proxy_tail("http://tiles.example.com/ArcGIS/rest?f=pjson");
        assert_eq!(parts.protocol, "http");
        assert_eq!(parts.host, "tiles.example.com");
        assert_eq!(parts.query, "f=pjson");
    }

    #[test]
    fn test_tail_without_scheme() {
        let parts = UrlParts::from_proxy_tail("tiles.example.com/ArcGIS/rest/services");
        assert_eq!(parts.protocol, "*");
        assert_eq!(parts.host, "tiles.example.com");
        assert_eq!(parts.path, "/ArcGIS/rest/services");
    }

    #[test]
    fn test_host_is_lowercased_path_preserved() {
        let parts = UrlParts::parse("HTTP://Tiles.Example.COM/ArcGIS/MapServer");
        assert_eq!(parts.protocol, "http");
        assert_eq!(parts.host, "tiles.example.com");
        assert_eq!(parts.path, "/ArcGIS/MapServer");
    }
}
