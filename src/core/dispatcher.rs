use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use hyper::StatusCode;
use tracing::Instrument;

use crate::config::ProxySettings;
use crate::core::referrer::ReferrerValidator;
use crate::core::request::{ProxyRequest, RequestEnvelope};
use crate::core::resource::{Resource, ResourceTable};
use crate::core::response::ProxyResponse;
use crate::core::status::{ping_document, render_status_page, ResourceStatus};
use crate::core::url::UrlParts;
use crate::error::ProxyError;
use crate::forwarder::Forwarder;
use crate::limiter::{Admission, RateLimiter};

/// Top-level per-request orchestration:
/// parse → validate referrer → match resource → meter → token → forward.
pub struct Dispatcher {
    settings: ProxySettings,
    resources: Arc<ResourceTable>,
    referrers: ReferrerValidator,
    limiter: RateLimiter,
    forwarder: Forwarder,
    started_at: SystemTime,
}

impl Dispatcher {
    pub fn new(
        settings: ProxySettings,
        resources: Arc<ResourceTable>,
        referrers: ReferrerValidator,
        limiter: RateLimiter,
        forwarder: Forwarder,
    ) -> Self {
        Self {
            settings,
            resources,
            referrers,
            limiter,
            forwarder,
            started_at: SystemTime::now(),
        }
    }

    /// Handle one inbound request. Errors never escape; every failure is
    /// rendered as the uniform JSON envelope.
    pub async fn dispatch(&self, request: ProxyRequest) -> ProxyResponse {
        let span = tracing::span!(
            tracing::Level::INFO,
            "request",
            request_id = request.id,
            method = %request.method,
            path = %request.uri.path(),
        );
        self.handle(request).instrument(span).await
    }

    async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        let path = request.uri.path().to_string();
        let referrer_key = self.referrers.validate(request.referer());

        if path == self.settings.ping_path {
            let key = referrer_key.as_deref().unwrap_or("-");
            return ProxyResponse::json(
                StatusCode::OK,
                ping_document(env!("CARGO_PKG_VERSION"), key),
            );
        }

        if path == self.settings.status_path {
            return self.status_page().await;
        }

        if let Some(tail) = self.proxy_tail(&request) {
            return match self.proxy(&request, &tail, referrer_key).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(
                        referrer = %request.referer().unwrap_or_default(),
                        target = %tail,
                        reason = %error,
                        "Request rejected"
                    );
                    ProxyResponse::error_envelope(&error, &request.full_path())
                }
            };
        }

        self.serve_static(&path).await
    }

    /// Extract the proxied tail when a listen prefix addresses this
    /// request. The prefix may be followed by `/`, `?` or `&`; anything
    /// else belongs to a different path.
    fn proxy_tail(&self, request: &ProxyRequest) -> Option<String> {
        let full = request.full_path();
        for prefix in &self.settings.listen_prefixes {
            if let Some(rest) = full.strip_prefix(prefix.as_str()) {
                let mut chars = rest.chars();
                match chars.next() {
                    Some('/') | Some('?') | Some('&') => {
                        return Some(chars.as_str().to_string())
                    }
                    None => return Some(String::new()),
                    _ => {}
                }
            }
        }
        None
    }

    async fn proxy(
        &self,
        request: &ProxyRequest,
        tail: &str,
        referrer_key: Option<String>,
    ) -> Result<ProxyResponse, ProxyError> {
        if tail.is_empty() {
            return Err(ProxyError::BadRequest("empty proxy target".to_string()));
        }

        let target = UrlParts::from_proxy_tail(tail);
        if !target.has_host() {
            return Err(ProxyError::BadRequest(tail.to_string()));
        }

        let referrer_key = referrer_key.ok_or_else(|| {
            ProxyError::ReferrerDenied(request.referer().unwrap_or_default().to_string())
        })?;

        let resource = match self.resources.match_resource(&target) {
            Some(resource) => resource,
            None if self.settings.must_match => {
                return Err(ProxyError::NoResource(target.to_string()))
            }
            None => Arc::new(Resource::pass_through(&target)),
        };

        if resource.rate_cap.is_some() {
            match self.limiter.check(&resource, &referrer_key).await {
                Ok(Admission::Admitted) => {}
                Ok(Admission::Denied) => {
                    return Err(ProxyError::RateExceeded(resource.url.clone()))
                }
                Err(error) => return Err(ProxyError::LimiterUnavailable(error)),
            }
        }

        resource.stats.record(request.received_at);
        tracing::info!(
            resource = %resource.url,
            referrer = %referrer_key,
            "Dispatching to upstream"
        );

        let envelope = RequestEnvelope {
            target,
            referrer_key,
            resource,
        };
        self.forwarder.forward(&envelope, request).await
    }

    async fn status_page(&self) -> ProxyResponse {
        let uptime = self
            .started_at
            .elapsed()
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let resources: Vec<ResourceStatus> = self
            .resources
            .iter()
            .map(|resource| {
                let (total, first, last) = resource.stats.snapshot();
                ResourceStatus {
                    url: resource.url.clone(),
                    total_requests: total,
                    first_request_ms: first,
                    last_request_ms: last,
                    rate_limited: resource.rate_cap.is_some(),
                }
            })
            .collect();

        let meters = match self.limiter.snapshot().await {
            Ok(rows) => rows,
            Err(error) => {
                tracing::error!(reason = %error, "Meter snapshot failed");
                Vec::new()
            }
        };

        ProxyResponse::html(
            StatusCode::OK,
            render_status_page(env!("CARGO_PKG_VERSION"), uptime, &resources, &meters),
        )
    }

    /// Non-proxy paths: a file from the configured static directory when
    /// one is set, else 404.
    async fn serve_static(&self, path: &str) -> ProxyResponse {
        let not_found = || {
            ProxyResponse::error_envelope(&ProxyError::NoResource(path.to_string()), path)
        };

        let dir = match &self.settings.static_dir {
            Some(dir) => dir,
            None => return not_found(),
        };
        if path.contains("..") {
            return not_found();
        }

        let relative = path.trim_start_matches('/');
        let file = if relative.is_empty() {
            Path::new(dir).join("index.html")
        } else {
            Path::new(dir).join(relative)
        };

        match tokio::fs::read(&file).await {
            Ok(data) => {
                let mut headers = hyper::HeaderMap::new();
                if let Ok(value) = static_content_type(&file).parse() {
                    headers.insert(hyper::header::CONTENT_TYPE, value);
                }
                ProxyResponse::new(StatusCode::OK, headers, data.into())
            }
            Err(_) => not_found(),
        }
    }
}

fn static_content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("xml") => "text/xml",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}
