use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use hyper::{header, HeaderMap, Method, Uri};

use crate::core::resource::Resource;
use crate::core::url::UrlParts;

/// A request as the listener hands it to the dispatcher: the parsed head,
/// the fully buffered body, the arrival stamp the resource counters
/// record, and a process-wide sequence number for log correlation.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub received_at: SystemTime,
    pub id: u64,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            method,
            uri,
            headers,
            body,
            received_at: SystemTime::now(),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Rebuild from a decomposed hyper request once the body has been
    /// buffered
    pub fn from_parts(head: hyper::http::request::Parts, body: Bytes) -> Self {
        Self::new(head.method, head.uri, head.headers, body)
    }

    /// The raw `Referer` header, when present and valid UTF-8
    pub fn referer(&self) -> Option<&str> {
        self.headers
            .get(header::REFERER)
            .and_then(|value| value.to_str().ok())
    }

    /// Path plus query as received, the string the tail extractor works on
    /// and the error envelope reports
    pub fn full_path(&self) -> String {
        match self.uri.query() {
            Some(query) => format!("{}?{}", self.uri.path(), query),
            None => self.uri.path().to_string(),
        }
    }
}

/// Per-request derived state threaded from the dispatcher into the
/// forwarder: the normalized upstream target, the canonical referrer key
/// and the matched resource.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// Normalized target of the requested upstream
    pub target: UrlParts,

    /// Canonical referrer key from the validator
    pub referrer_key: String,

    /// The matched resource
    pub resource: std::sync::Arc<Resource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path_and_query: &str, headers: HeaderMap) -> ProxyRequest {
        ProxyRequest::new(
            Method::GET,
            path_and_query.parse().unwrap(),
            headers,
            Bytes::new(),
        )
    }

    #[test]
    fn test_full_path_includes_query() {
        let req = request("/proxy/http/tiles.example.com/svc?f=json", HeaderMap::new());
        assert_eq!(req.full_path(), "/proxy/http/tiles.example.com/svc?f=json");

        let req = request("/ping", HeaderMap::new());
        assert_eq!(req.full_path(), "/ping");
    }

    #[test]
    fn test_referer_accessor() {
        let mut headers = HeaderMap::new();
        headers.insert("referer", "https://app.example.org/map".parse().unwrap());
        let req = request("/proxy/x", headers);
        assert_eq!(req.referer(), Some("https://app.example.org/map"));

        let req = request("/proxy/x", HeaderMap::new());
        assert_eq!(req.referer(), None);
    }

    #[test]
    fn test_ids_are_sequential() {
        let first = request("/a", HeaderMap::new());
        let second = request("/b", HeaderMap::new());
        assert!(second.id > first.id);
    }
}
