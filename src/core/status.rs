//! The ping document and the HTML status page.

use chrono::{TimeZone, Utc};

use crate::limiter::MeterRow;

/// Per-resource counter snapshot shown on the status page
#[derive(Debug, Clone)]
pub struct ResourceStatus {
    pub url: String,
    pub total_requests: u64,
    pub first_request_ms: Option<u64>,
    pub last_request_ms: Option<u64>,
    pub rate_limited: bool,
}

/// The small JSON document answering the ping path
pub fn ping_document(version: &str, referrer_key: &str) -> String {
    serde_json::json!({
        "Proxy Version": version,
        "Configuration File": "OK",
        "Log File": "OK",
        "referrer": referrer_key,
    })
    .to_string()
}

/// The aggregated HTML status page: uptime, per-resource counters and a
/// dump of the meter rows.
pub fn render_status_page(
    version: &str,
    uptime_seconds: u64,
    resources: &[ResourceStatus],
    meters: &[MeterRow],
) -> String {
    let mut page = String::with_capacity(2048);
    page.push_str("<!DOCTYPE html><html><head><title>Proxy status</title></head><body>");
    page.push_str(&format!(
        "<h1>Proxy status</h1><p>Version {} &middot; up {}</p>",
        escape(version),
        format_uptime(uptime_seconds)
    ));

    page.push_str("<h2>Resources</h2><table border=\"1\"><tr><th>URL</th><th>Requests</th><th>First</th><th>Last</th><th>Rate limited</th></tr>");
    for resource in resources {
        page.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(&resource.url),
            resource.total_requests,
            format_timestamp(resource.first_request_ms),
            format_timestamp(resource.last_request_ms),
            if resource.rate_limited { "yes" } else { "no" },
        ));
    }
    page.push_str("</table>");

    page.push_str("<h2>Meters</h2><table border=\"1\"><tr><th>URL</th><th>Referrer</th><th>Window count</th><th>Window start</th><th>Total</th><th>Rejected</th></tr>");
    for row in meters {
        page.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{:.3}</td><td>{}</td><td>{}</td></tr>",
            escape(&row.url),
            escape(&row.referrer),
            row.window_count,
            row.window_start,
            row.total,
            row.rejected,
        ));
    }
    page.push_str("</table></body></html>");
    page
}

fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, secs)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    }
}

fn format_timestamp(ms: Option<u64>) -> String {
    match ms {
        Some(ms) => Utc
            .timestamp_millis_opt(ms as i64)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
        None => "-".to_string(),
    }
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_document_keys() {
        let doc = ping_document("0.1.5", "*");
        let parsed: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(parsed["Proxy Version"], "0.1.5");
        assert_eq!(parsed["Configuration File"], "OK");
        assert_eq!(parsed["Log File"], "OK");
        assert_eq!(parsed["referrer"], "*");
    }

    #[test]
    fn test_status_page_contains_counters() {
        let resources = vec![ResourceStatus {
            url: "http://tiles.example.com/svc".to_string(),
            total_requests: 42,
            first_request_ms: Some(1_700_000_000_000),
            last_request_ms: Some(1_700_000_060_000),
            rate_limited: true,
        }];
        let page = render_status_page("0.1.5", 3_700, &resources, &[]);
        assert!(page.contains("http://tiles.example.com/svc"));
        assert!(page.contains("42"));
        assert!(page.contains("01:01:40"));
    }

    #[test]
    fn test_status_page_escapes_html() {
        let resources = vec![ResourceStatus {
            url: "http://x/<script>".to_string(),
            total_requests: 0,
            first_request_ms: None,
            last_request_ms: None,
            rate_limited: false,
        }];
        let page = render_status_page("0.1.5", 0, &resources, &[]);
        assert!(!page.contains("<script>"));
        assert!(page.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_uptime_formatting() {
        assert_eq!(format_uptime(59), "00:00:59");
        assert_eq!(format_uptime(90_061), "1d 01:01:01");
    }
}
