use bytes::Bytes;
use hyper::{HeaderMap, StatusCode};

use crate::error::ProxyError;

/// Represents a response produced by the proxy, either relayed from an
/// upstream or generated locally.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// HTTP status code
    pub status: StatusCode,

    /// HTTP headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Bytes,
}

impl ProxyResponse {
    /// Create a new ProxyResponse
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// A JSON response with the given body
    pub fn json(status: StatusCode, body: String) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        Self::new(status, headers, Bytes::from(body))
    }

    /// An HTML response with the given body
    pub fn html(status: StatusCode, body: String) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/html; charset=utf-8"),
        );
        Self::new(status, headers, Bytes::from(body))
    }

    /// The uniform error envelope:
    /// `{"error":{"code":N,"message":M,"details":M},"request":<url>}`
    /// with the HTTP status equal to the code when it is a valid status,
    /// else 500. The client never sees credentials or internal detail
    /// beyond the error's display string.
    pub fn error_envelope(error: &ProxyError, request_url: &str) -> Self {
        let code = error.status_code();
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = error.to_string();
        let body = serde_json::json!({
            "error": {
                "code": code,
                "message": message,
                "details": message,
            },
            "request": request_url,
        });
        Self::json(status, body.to_string())
    }
}
