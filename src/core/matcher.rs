//! Wildcard-aware matching of a normalized request target against the
//! configured resource set. First match in configuration order wins.

use crate::core::resource::Resource;
use crate::core::url::UrlParts;

/// True when the resource pattern accepts the request target.
///
/// Port is deliberately not part of matching; see DESIGN.md.
pub fn matches(resource: &Resource, target: &UrlParts) -> bool {
    protocols_match(&resource.pattern.protocol, &target.protocol)
        && hosts_match(&resource.pattern.host, &target.host)
        && paths_match(
            &resource.pattern.path,
            &target.path,
            resource.match_all,
        )
}

/// Protocol comparison: a wildcard on either side accepts.
pub fn protocols_match(pattern: &str, protocol: &str) -> bool {
    pattern == "*" || protocol == "*" || pattern.eq_ignore_ascii_case(protocol)
}

/// Segment-wise host comparison. Both hosts are split on `.` and must have
/// the same number of segments; each pattern segment is either `*` or a
/// case-insensitive match. A bare `*` pattern accepts any host.
pub fn hosts_match(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let host_segments: Vec<&str> = host.split('.').collect();
    if pattern_segments.len() != host_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(host_segments.iter())
        .all(|(p, h)| *p == "*" || p.eq_ignore_ascii_case(h))
}

/// Path comparison. Exact-path resources require equality; prefix
/// resources accept any path that starts with the pattern. A `*` pattern
/// accepts anything.
pub fn paths_match(pattern: &str, path: &str, match_all: bool) -> bool {
    if pattern == "*" {
        return true;
    }
    if match_all {
        path.eq_ignore_ascii_case(pattern)
    } else {
        let path = path.to_ascii_lowercase();
        path.starts_with(&pattern.to_ascii_lowercase())
    }
}
