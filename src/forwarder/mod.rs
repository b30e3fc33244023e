pub mod inspect;

use std::sync::Arc;

use bytes::Bytes;
use hyper::{HeaderMap, StatusCode};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::broker::TokenBroker;
use crate::core::request::{ProxyRequest, RequestEnvelope};
use crate::core::resource::Resource;
use crate::core::response::ProxyResponse;
use crate::core::url::UrlParts;
use crate::error::ProxyError;

/// Error-envelope codes that signal an expired or rejected token
const AUTH_FAILURE_CODES: [u16; 3] = [403, 498, 499];

/// Query components are encoded per RFC 3986 unreserved characters, so a
/// space becomes `%20` rather than `+`.
const QUERY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Headers never relayed between the client and the upstream
const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

struct UpstreamResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Splices a client request to its upstream: merges parameters, injects
/// tokens, relays the response and watches for auth-failure envelopes so
/// a transparent one-shot retry with a fresh token can happen.
pub struct Forwarder {
    client: reqwest::Client,
    broker: Arc<TokenBroker>,
    inspect_cap: usize,
}

impl Forwarder {
    pub fn new(client: reqwest::Client, broker: Arc<TokenBroker>, inspect_cap: usize) -> Self {
        Self {
            client,
            broker,
            inspect_cap,
        }
    }

    /// Forward one request. At most one retry happens, and only when a
    /// credential-bearing resource answers with an auth-failure envelope.
    pub async fn forward(
        &self,
        envelope: &RequestEnvelope,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        let resource = &envelope.resource;

        let token = if resource.is_credential_bearing() {
            Some(
                self.broker
                    .token_for(resource, &envelope.referrer_key)
                    .await?,
            )
        } else {
            None
        };

        let url = compose_upstream_url(envelope, token.as_deref());
        tracing::debug!(request_id = request.id, upstream = %url, "Forwarding");
        let first = self.send(request, &url).await?;

        if resource.is_credential_bearing() {
            if let Some(code) = self.auth_failure(&first) {
                tracing::warn!(
                    resource = %resource.url,
                    code,
                    "Upstream reported token failure, retrying with a fresh token"
                );
                let fresh = self
                    .broker
                    .refresh(resource, &envelope.referrer_key)
                    .await?;
                let retry_url = compose_upstream_url(envelope, Some(&fresh));
                let second = self.send(request, &retry_url).await?;
                if self.auth_failure(&second).is_none() {
                    return Ok(finalize(second));
                }
                // Second failure: the original error response goes back
                return Ok(finalize(first));
            }
        }

        Ok(finalize(first))
    }

    async fn send(&self, request: &ProxyRequest, url: &str) -> Result<UpstreamResponse, ProxyError> {
        let headers = relay_headers(&request.headers);

        let mut timed_out_once = false;
        let response = loop {
            let attempt = self
                .client
                .request(request.method.clone(), url)
                .headers(headers.clone())
                .body(request.body.clone());
            match attempt.send().await {
                Ok(response) => break response,
                Err(e) if e.is_timeout() && !timed_out_once => {
                    tracing::warn!(upstream = %url, "Upstream timed out, retrying once");
                    timed_out_once = true;
                }
                Err(e) if e.is_timeout() => return Err(ProxyError::UpstreamTimeout),
                Err(e) => return Err(ProxyError::UpstreamUnavailable(e.to_string())),
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::UpstreamUnavailable(e.to_string()))?;
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    /// Inspect a bounded prefix of the response for an auth-failure
    /// envelope. Only meaningful for credential-bearing resources.
    fn auth_failure(&self, response: &UpstreamResponse) -> Option<u16> {
        let prefix_len = response.body.len().min(self.inspect_cap);
        let prefix = &response.body[..prefix_len];
        let encoding = response
            .headers
            .get("content-encoding")
            .and_then(|v| v.to_str().ok());
        let decoded = inspect::decompress_prefix(encoding, prefix, self.inspect_cap);
        inspect::error_envelope_code(&decoded).filter(|code| AUTH_FAILURE_CODES.contains(code))
    }
}

/// Relay headers minus hop-by-hop entries. `Host` is dropped here and set
/// by the client from the upstream URL.
fn relay_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn finalize(upstream: UpstreamResponse) -> ProxyResponse {
    let mut headers = relay_headers(&upstream.headers);
    let rewritten = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(inspect::rewrite_content_type);
    if let Some(Ok(parsed)) = rewritten.map(|value| value.parse::<hyper::header::HeaderValue>()) {
        headers.insert("content-type", parsed);
    }
    ProxyResponse::new(upstream.status, headers, upstream.body)
}

/// Compose the upstream URL: host-redirect rules, then the merged and
/// re-encoded query string with token injection.
pub fn compose_upstream_url(envelope: &RequestEnvelope, broker_token: Option<&str>) -> String {
    let resource = &envelope.resource;
    let target = &envelope.target;

    let scheme = if target.protocol != "*" {
        target.protocol.as_str()
    } else if resource.pattern.protocol != "*" {
        resource.pattern.protocol.as_str()
    } else {
        "http"
    };

    let (host, port, path) = match &resource.host_redirect {
        Some(redirect) => {
            let path = if redirect.path == "*" || redirect.path.is_empty() {
                target.path_or_root().to_string()
            } else {
                redirect.path.clone()
            };
            (redirect.host.clone(), redirect.port.clone(), path)
        }
        None => {
            let host = if resource.pattern.host.contains('*') {
                target.host.clone()
            } else {
                resource.pattern.host.clone()
            };
            (host, target.port.clone(), target.path_or_root().to_string())
        }
    };

    let query = merged_query(resource, target, broker_token);

    let mut url = format!("{}://{}", scheme, host);
    if port != "*" && !port.is_empty() {
        url.push(':');
        url.push_str(&port);
    }
    url.push_str(&path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query);
    }
    url
}

/// The merged parameter map: resource query, overlaid with the request
/// query, with the token parameter injected when absent.
fn merged_query(resource: &Resource, target: &UrlParts, broker_token: Option<&str>) -> String {
    let mut params = parse_query(resource.pattern.query_or_empty());
    overlay(&mut params, parse_query(target.query_or_empty()));

    let has_token = params.iter().any(|(key, _)| key == &resource.token_param);
    if !has_token {
        if let Some(token) = broker_token {
            params.push((resource.token_param.clone(), token.to_string()));
        } else if let Some(token) = resource.static_token() {
            params.push((resource.token_param.clone(), token.to_string()));
        }
    }

    serialize_query(&params)
}

/// Parse a raw query string into an ordered key→value list. `+` is read
/// as an encoded space.
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|piece| !piece.is_empty())
        .map(|piece| {
            let (key, value) = match piece.split_once('=') {
                Some((key, value)) => (key, value),
                None => (piece, ""),
            };
            (decode_component(key), decode_component(value))
        })
        .collect()
}

/// Serialize an ordered key→value list, percent-encoding each key and
/// value individually (space becomes `%20`).
pub fn serialize_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(key, QUERY_ENCODE),
                utf8_percent_encode(value, QUERY_ENCODE)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn overlay(base: &mut Vec<(String, String)>, extra: Vec<(String, String)>) {
    for (key, value) in extra {
        match base.iter_mut().find(|(existing, _)| existing == &key) {
            Some(entry) => entry.1 = value,
            None => base.push((key, value)),
        }
    }
}

fn decode_component(raw: &str) -> String {
    let unplussed = raw.replace('+', " ");
    percent_decode_str(&unplussed)
        .decode_utf8_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDefinition;
    use crate::core::resource::Resource;

    fn envelope(def: ResourceDefinition, tail: &str) -> RequestEnvelope {
        RequestEnvelope {
            target: UrlParts::from_proxy_tail(tail),
            referrer_key: "*".to_string(),
            resource: Arc::new(Resource::from_definition(&def).unwrap()),
        }
    }

    #[test]
    fn test_matched_pass_through_url() {
        let def = ResourceDefinition {
            url: "http://tiles.example.com/ArcGIS/rest/services".to_string(),
            match_all: false,
            ..ResourceDefinition::default()
        };
        let envelope = envelope(
            def,
            "http/tiles.example.com/ArcGIS/rest/services/World/MapServer?f=pjson",
        );
        assert_eq!(
            compose_upstream_url(&envelope, None),
            "http://tiles.example.com/ArcGIS/rest/services/World/MapServer?f=pjson"
        );
    }

    #[test]
    fn test_static_token_injection() {
        let def = ResourceDefinition {
            url: "http://tiles.example.com/svc".to_string(),
            access_token: Some("SECRET".to_string()),
            ..ResourceDefinition::default()
        };
        let envelope = envelope(def, "http/tiles.example.com/svc?f=json");
        assert_eq!(
            compose_upstream_url(&envelope, None),
            "http://tiles.example.com/svc?f=json&token=SECRET"
        );
    }

    #[test]
    fn test_existing_token_parameter_is_kept() {
        let def = ResourceDefinition {
            url: "http://tiles.example.com/svc".to_string(),
            access_token: Some("SECRET".to_string()),
            ..ResourceDefinition::default()
        };
        let envelope = envelope(def, "http/tiles.example.com/svc?token=CLIENT");
        assert_eq!(
            compose_upstream_url(&envelope, None),
            "http://tiles.example.com/svc?token=CLIENT"
        );
    }

    #[test]
    fn test_broker_token_injection_with_custom_param() {
        let def = ResourceDefinition {
            url: "http://tiles.example.com/svc".to_string(),
            username: Some("u".to_string()),
            password: Some("p".to_string()),
            token_param: Some("auth".to_string()),
            ..ResourceDefinition::default()
        };
        let envelope = envelope(def, "http/tiles.example.com/svc");
        assert_eq!(
            compose_upstream_url(&envelope, Some("FRESH")),
            "http://tiles.example.com/svc?auth=FRESH"
        );
    }

    #[test]
    fn test_resource_query_is_overlaid_by_request() {
        let def = ResourceDefinition {
            url: "http://tiles.example.com/svc?f=json&layers=base".to_string(),
            ..ResourceDefinition::default()
        };
        let envelope = envelope(def, "http/tiles.example.com/svc?layers=roads");
        assert_eq!(
            compose_upstream_url(&envelope, None),
            "http://tiles.example.com/svc?f=json&layers=roads"
        );
    }

    #[test]
    fn test_host_redirect_with_own_path() {
        let def = ResourceDefinition {
            url: "http://public.example.com/maps".to_string(),
            host_redirect: Some("http://internal.example.net:6080/arcgis".to_string()),
            ..ResourceDefinition::default()
        };
        let envelope = envelope(def, "http/public.example.com/maps/World");
        assert_eq!(
            compose_upstream_url(&envelope, None),
            "http://internal.example.net:6080/arcgis"
        );
    }

    #[test]
    fn test_host_redirect_keeps_request_path_when_wildcard() {
        let def = ResourceDefinition {
            url: "http://public.example.com/maps".to_string(),
            host_redirect: Some("http://internal.example.net".to_string()),
            ..ResourceDefinition::default()
        };
        let envelope = envelope(def, "http/public.example.com/maps/World");
        assert_eq!(
            compose_upstream_url(&envelope, None),
            "http://internal.example.net/maps/World"
        );
    }

    #[test]
    fn test_scheme_falls_back_to_resource() {
        let def = ResourceDefinition {
            url: "https://secure.example.com/svc".to_string(),
            ..ResourceDefinition::default()
        };
        let envelope = envelope(def, "secure.example.com/svc");
        assert!(compose_upstream_url(&envelope, None).starts_with("https://"));
    }

    #[test]
    fn test_merge_idempotence() {
        let query = "f=json&layers=base%20map&srs=EPSG%3A4326";
        let mut params = parse_query(query);
        overlay(&mut params, parse_query(query));
        assert_eq!(serialize_query(&params), query);
    }

    #[test]
    fn test_space_encodes_as_percent_20() {
        let params = vec![("where".to_string(), "NAME = 'Fort Collins'".to_string())];
        let serialized = serialize_query(&params);
        assert!(serialized.contains("%20"));
        assert!(!serialized.contains('+'));
        assert_eq!(
            serialized,
            "where=NAME%20%3D%20%27Fort%20Collins%27"
        );
    }

    #[test]
    fn test_plus_is_read_as_space() {
        let params = parse_query("where=a+b");
        assert_eq!(params[0].1, "a b");
        assert_eq!(serialize_query(&params), "where=a%20b");
    }

    #[test]
    fn test_relay_headers_drop_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "public.example.com".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());
        headers.insert("content-length", "12".parse().unwrap());

        let relayed = relay_headers(&headers);
        assert!(relayed.get("host").is_none());
        assert!(relayed.get("connection").is_none());
        assert!(relayed.get("content-length").is_none());
        assert_eq!(relayed.get("accept").unwrap(), "application/json");
    }
}
