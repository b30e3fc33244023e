use crate::core::matcher::hosts_match;
use crate::core::url::UrlParts;

/// One normalized allow-list entry. The canonical `key` is the configured
/// string itself, so meter rows and status output always index the same
/// caller class.
#[derive(Debug, Clone)]
pub struct ReferrerPattern {
    pub protocol: String,
    pub host: String,
    pub path: String,

    /// Exact path comparison when true; prefix comparison when the
    /// configured path ended in `*`
    pub exact_path: bool,

    /// Canonical allow-list key
    pub key: String,
}

impl ReferrerPattern {
    pub fn new(entry: &str) -> Self {
        let key = entry.trim().to_string();
        let parts = UrlParts::parse(&key);
        let (path, exact_path) = match parts.path.as_str() {
            "*" | "/*" => ("*".to_string(), false),
            p if p.ends_with('*') => (p.trim_end_matches('*').to_string(), false),
            p => (p.to_string(), true),
        };
        Self {
            protocol: parts.protocol,
            host: parts.host,
            path,
            exact_path,
            key,
        }
    }

    /// True when this pattern accepts the normalized referrer
    fn accepts(&self, referrer: &UrlParts) -> bool {
        if !(self.protocol == "*" || self.protocol.eq_ignore_ascii_case(&referrer.protocol)) {
            return false;
        }
        if !hosts_match(&self.host, &referrer.host) {
            return false;
        }
        if self.path == "*" {
            return true;
        }
        if self.exact_path {
            referrer.path.eq_ignore_ascii_case(&self.path)
        } else {
            referrer
                .path
                .to_ascii_lowercase()
                .starts_with(&self.path.to_ascii_lowercase())
        }
    }
}

/// Validates the incoming `Referer` header against the configured
/// allow-list and maps it to the canonical key used by the rate limiter.
#[derive(Debug, Default)]
pub struct ReferrerValidator {
    accept_any: bool,
    patterns: Vec<ReferrerPattern>,
}

impl ReferrerValidator {
    /// Build the validator from the configured allow-list. The sentinel
    /// entry `*` switches on the accept-any fast path.
    pub fn from_allowed(allowed: &[String]) -> Self {
        let accept_any = allowed.iter().any(|entry| entry.trim() == "*");
        let patterns = if accept_any {
            Vec::new()
        } else {
            allowed
                .iter()
                .filter(|entry| !entry.trim().is_empty())
                .map(|entry| ReferrerPattern::new(entry))
                .collect()
        };
        Self {
            accept_any,
            patterns,
        }
    }

    /// Accept or reject a raw `Referer` header value. Returns the canonical
    /// key of the matching pattern, `*` in accept-any mode, or `None` when
    /// the referrer is rejected.
    pub fn validate(&self, referer: Option<&str>) -> Option<String> {
        if self.accept_any {
            return Some("*".to_string());
        }
        let raw = referer?.trim();
        if raw.is_empty() {
            return None;
        }
        let normalized = UrlParts::parse(raw);
        self.patterns
            .iter()
            .find(|pattern| pattern.accepts(&normalized))
            .map(|pattern| pattern.key.clone())
    }

    /// The canonical key set, used to preallocate meter rows
    pub fn keys(&self) -> Vec<String> {
        if self.accept_any {
            vec!["*".to_string()]
        } else {
            self.patterns.iter().map(|p| p.key.clone()).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(entries: &[&str]) -> ReferrerValidator {
        let allowed: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
        ReferrerValidator::from_allowed(&allowed)
    }

    #[test]
    fn test_accept_any_fast_path() {
        let v = validator(&["*"]);
        assert_eq!(v.validate(Some("https://anything.example/x")).as_deref(), Some("*"));
        assert_eq!(v.validate(None).as_deref(), Some("*"));
        assert_eq!(v.keys(), vec!["*".to_string()]);
    }

    #[test]
    fn test_exact_host_accept() {
        let v = validator(&["https://app.example.org"]);
        assert_eq!(
            v.validate(Some("https://app.example.org/map/index.html")).as_deref(),
            Some("https://app.example.org")
        );
    }

    #[test]
    fn test_unlisted_referrer_rejected() {
        let v = validator(&["https://app.example.org"]);
        assert!(v.validate(Some("https://evil.example.net/")).is_none());
    }

    #[test]
    fn test_missing_referrer_rejected_when_list_configured() {
        let v = validator(&["https://app.example.org"]);
        assert!(v.validate(None).is_none());
        assert!(v.validate(Some("   ")).is_none());
    }

    #[test]
    fn test_wildcard_host_segments() {
        let v = validator(&["https://*.example.org"]);
        assert!(v.validate(Some("https://maps.example.org/viewer")).is_some());
        assert!(v.validate(Some("https://deep.maps.example.org/viewer")).is_none());
    }

    #[test]
    fn test_protocol_must_match_pattern() {
        let v = validator(&["https://app.example.org"]);
        assert!(v.validate(Some("http://app.example.org/")).is_none());
    }

    #[test]
    fn test_path_prefix_pattern() {
        let v = validator(&["https://app.example.org/viewer/*"]);
        assert!(v
            .validate(Some("https://app.example.org/viewer/map.html"))
            .is_some());
        assert!(v.validate(Some("https://app.example.org/admin")).is_none());
    }

    #[test]
    fn test_exact_path_pattern() {
        let v = validator(&["https://app.example.org/viewer/map.html"]);
        assert!(v
            .validate(Some("https://app.example.org/viewer/map.html"))
            .is_some());
        assert!(v
            .validate(Some("https://app.example.org/viewer/map.html/extra"))
            .is_none());
    }

    #[test]
    fn test_key_is_canonical_configured_string() {
        let v = validator(&["https://a.example.org", "https://b.example.org"]);
        assert_eq!(
            v.validate(Some("https://b.example.org/page")).as_deref(),
            Some("https://b.example.org")
        );
        assert_eq!(
            v.keys(),
            vec![
                "https://a.example.org".to_string(),
                "https://b.example.org".to_string()
            ]
        );
    }
}
