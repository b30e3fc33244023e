use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::ResourceDefinition;
use crate::core::url::UrlParts;
use crate::error::ConfigError;

/// Credential material attached to a resource. At most one mode per
/// resource, verified at configuration load.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// No upstream authentication
    None,

    /// A long-lived access token configured directly
    StaticToken { token: String },

    /// Username and password exchanged through the user-credential flow
    User { username: String, password: String },

    /// Application id and secret exchanged through the OAuth-style flow
    App {
        client_id: String,
        client_secret: String,
    },
}

/// Rate cap: `rate_limit` admissions per `rate_limit_period` minutes
#[derive(Debug, Clone, Copy)]
pub struct RateCap {
    pub rate_limit: u32,
    pub rate_limit_period: u32,
}

impl RateCap {
    /// Length of one admission window in seconds
    pub fn window_seconds(&self) -> f64 {
        f64::from(self.rate_limit_period) * 60.0 / f64::from(self.rate_limit)
    }
}

/// A live upstream token held by a resource. Populated by the broker,
/// consulted by the forwarder.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub value: String,
    pub acquired_at: SystemTime,
    pub expires_at: SystemTime,
}

impl CachedToken {
    pub fn is_live(&self) -> bool {
        SystemTime::now() < self.expires_at
    }
}

/// Request counters on a resource. Incremented at dispatch time; reads
/// produce a consistent snapshot for the status page.
#[derive(Debug, Default)]
pub struct ResourceStats {
    total_requests: AtomicU64,
    first_request_ms: AtomicU64,
    last_request_ms: AtomicU64,
}

impl ResourceStats {
    pub fn record(&self, now: SystemTime) {
        let now_ms = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let _ = self.first_request_ms.compare_exchange(
            0,
            now_ms,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        self.last_request_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, Option<u64>, Option<u64>) {
        let total = self.total_requests.load(Ordering::Relaxed);
        let first = self.first_request_ms.load(Ordering::Relaxed);
        let last = self.last_request_ms.load(Ordering::Relaxed);
        (
            total,
            if first == 0 { None } else { Some(first) },
            if last == 0 { None } else { Some(last) },
        )
    }
}

/// One configured upstream destination plus its credentials and policy.
/// Immutable after load except for the counters and the token slot.
#[derive(Debug)]
pub struct Resource {
    /// The configured URL string, used as the meter key and as the
    /// `serverURL` value in token exchanges
    pub url: String,

    /// Parsed form of the configured URL pattern
    pub pattern: UrlParts,

    /// Exact-path matching when true, prefix matching when false
    pub match_all: bool,

    /// Optional redirect target, parsed once at load
    pub host_redirect: Option<UrlParts>,

    /// Credential mode
    pub credentials: Credentials,

    /// Explicit OAuth endpoint for the app-credential flow
    pub oauth_endpoint: Option<String>,

    /// Name of the injected token query parameter
    pub token_param: String,

    /// Optional rate cap
    pub rate_cap: Option<RateCap>,

    /// Request counters
    pub stats: ResourceStats,

    token_slot: RwLock<Option<CachedToken>>,
}

impl Resource {
    /// Build a resource from its configuration entry, enforcing the
    /// credential-exclusivity and rate-cap invariants.
    pub fn from_definition(def: &ResourceDefinition) -> Result<Self, ConfigError> {
        let credentials = def.credentials()?;

        let rate_cap = match (def.rate_limit, def.rate_limit_period) {
            (None, None) => None,
            (Some(limit), Some(period)) => {
                if limit == 0 || period == 0 {
                    return Err(ConfigError::ValidationError(format!(
                        "resource {}: rateLimit and rateLimitPeriod must both be positive",
                        def.url
                    )));
                }
                Some(RateCap {
                    rate_limit: limit,
                    rate_limit_period: period,
                })
            }
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "resource {}: rateLimit and rateLimitPeriod must be set together",
                    def.url
                )))
            }
        };

        Ok(Self {
            url: def.url.clone(),
            pattern: UrlParts::parse(&def.url),
            match_all: def.match_all,
            host_redirect: def.host_redirect.as_deref().map(UrlParts::parse),
            credentials,
            oauth_endpoint: def.oauth_endpoint.clone(),
            token_param: def
                .token_param
                .clone()
                .unwrap_or_else(|| "token".to_string()),
            rate_cap,
            stats: ResourceStats::default(),
            token_slot: RwLock::new(None),
        })
    }

    /// Synthetic resource used when no configured resource matches and
    /// must-match is off: forward as-is, no credentials, no cap.
    pub fn pass_through(target: &UrlParts) -> Self {
        Self {
            url: target.to_string(),
            pattern: target.clone(),
            match_all: false,
            host_redirect: None,
            credentials: Credentials::None,
            oauth_endpoint: None,
            token_param: "token".to_string(),
            rate_cap: None,
            stats: ResourceStats::default(),
            token_slot: RwLock::new(None),
        }
    }

    /// True for user- or app-credential resources, the ones the broker
    /// can mint tokens for
    pub fn is_credential_bearing(&self) -> bool {
        matches!(
            self.credentials,
            Credentials::User { .. } | Credentials::App { .. }
        )
    }

    pub fn static_token(&self) -> Option<&str> {
        match &self.credentials {
            Credentials::StaticToken { token } => Some(token),
            _ => None,
        }
    }

    /// The cached token when one is present and unexpired
    pub fn live_token(&self) -> Option<String> {
        let slot = self.token_slot.read().ok()?;
        match slot.as_ref() {
            Some(entry) if entry.is_live() => Some(entry.value.clone()),
            _ => None,
        }
    }

    /// Replace the cached token. Replacement is atomic with respect to
    /// readers.
    pub fn store_token(&self, token: CachedToken) {
        if let Ok(mut slot) = self.token_slot.write() {
            *slot = Some(token);
        }
    }

    /// Drop the cached token, forcing the next request through the broker
    pub fn invalidate_token(&self) {
        if let Ok(mut slot) = self.token_slot.write() {
            *slot = None;
        }
    }
}

/// The configured resource set, in configuration order. Read-mostly;
/// rebuilt wholesale on configuration reload.
#[derive(Debug, Default)]
pub struct ResourceTable {
    resources: Vec<std::sync::Arc<Resource>>,
}

impl ResourceTable {
    pub fn from_definitions(defs: &[ResourceDefinition]) -> Result<Self, ConfigError> {
        let mut resources = Vec::with_capacity(defs.len());
        for def in defs {
            resources.push(std::sync::Arc::new(Resource::from_definition(def)?));
        }
        Ok(Self { resources })
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<Resource>> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// First resource matching the normalized request target, if any
    pub fn match_resource(&self, target: &UrlParts) -> Option<std::sync::Arc<Resource>> {
        self.resources
            .iter()
            .find(|r| crate::core::matcher::matches(r, target))
            .cloned()
    }
}
