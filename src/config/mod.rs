use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::resource::Credentials;
use crate::error::ConfigError;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Whether to log in JSON format
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Proxy behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    /// Path prefixes that address the proxy itself
    pub listen_prefixes: Vec<String>,

    /// Path answering the ping document
    pub ping_path: String,

    /// Path answering the HTML status page
    pub status_path: String,

    /// When true, requests matching no configured resource are rejected
    /// with 404 instead of being passed through
    pub must_match: bool,

    /// Referrer allow-list; the sentinel `*` accepts any referrer
    pub allowed_referrers: Vec<String>,

    /// Optional directory served for non-proxy paths
    pub static_dir: Option<String>,

    /// File backing the meter store, relative to the working directory
    pub meter_db_path: String,

    /// Maximum number of response bytes inspected for auth-failure
    /// envelopes
    pub inspect_cap_bytes: usize,

    /// Upstream request timeout in seconds
    pub upstream_timeout_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_prefixes: vec!["/proxy".to_string()],
            ping_path: "/ping".to_string(),
            status_path: "/status".to_string(),
            must_match: true,
            allowed_referrers: vec!["*".to_string()],
            static_dir: None,
            meter_db_path: "proxy_meter.db".to_string(),
            inspect_cap_bytes: 64 * 1024,
            upstream_timeout_secs: 30,
        }
    }
}

/// One configured upstream resource. Field names mirror the configuration
/// file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceDefinition {
    /// URL pattern; `*` is permitted in any component
    pub url: String,

    /// Exact-path matching when true, prefix matching when false
    pub match_all: bool,

    /// Optional redirect target overriding the matched host
    pub host_redirect: Option<String>,

    /// Static access token
    pub access_token: Option<String>,

    /// User-credential flow
    pub username: Option<String>,
    pub password: Option<String>,

    /// App-credential flow
    pub client_id: Option<String>,
    pub client_secret: Option<String>,

    /// Explicit OAuth endpoint for the app-credential flow
    pub oauth_endpoint: Option<String>,

    /// Name of the injected token parameter (default `token`)
    pub token_param: Option<String>,

    /// Rate cap: `rate_limit` requests per `rate_limit_period` minutes
    pub rate_limit: Option<u32>,
    pub rate_limit_period: Option<u32>,
}

impl ResourceDefinition {
    /// Resolve the credential mode, rejecting definitions that mix modes
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let has_static = self.access_token.is_some();
        let has_user = self.username.is_some() || self.password.is_some();
        let has_app = self.client_id.is_some() || self.client_secret.is_some();

        let modes = [has_static, has_user, has_app]
            .iter()
            .filter(|m| **m)
            .count();
        if modes > 1 {
            return Err(ConfigError::ValidationError(format!(
                "resource {}: at most one credential mode (accessToken, username/password, clientId/clientSecret) may be set",
                self.url
            )));
        }

        if let Some(token) = &self.access_token {
            return Ok(Credentials::StaticToken {
                token: token.clone(),
            });
        }
        if has_user {
            return match (&self.username, &self.password) {
                (Some(username), Some(password)) => Ok(Credentials::User {
                    username: username.clone(),
                    password: password.clone(),
                }),
                _ => Err(ConfigError::ValidationError(format!(
                    "resource {}: username and password must be set together",
                    self.url
                ))),
            };
        }
        if has_app {
            return match (&self.client_id, &self.client_secret) {
                (Some(client_id), Some(client_secret)) => Ok(Credentials::App {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                }),
                _ => Err(ConfigError::ValidationError(format!(
                    "resource {}: clientId and clientSecret must be set together",
                    self.url
                ))),
            };
        }
        Ok(Credentials::None)
    }
}

/// Main proxy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Proxy behavior
    pub proxy: ProxySettings,

    /// Configured resources, in matching order
    pub resources: Vec<ResourceDefinition>,
}

impl AppConfig {
    /// Validate the invariants the rest of the system relies on. Called
    /// once at load; violations abort startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.listen_prefixes.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one listen prefix is required".to_string(),
            ));
        }
        for prefix in &self.proxy.listen_prefixes {
            if !prefix.starts_with('/') || prefix.len() < 2 {
                return Err(ConfigError::ValidationError(format!(
                    "listen prefix {:?} must start with '/' and be non-empty",
                    prefix
                )));
            }
        }
        if self.proxy.inspect_cap_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "inspectCapBytes must be positive".to_string(),
            ));
        }
        for def in &self.resources {
            if def.url.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "resource url must not be empty".to_string(),
                ));
            }
            // Credential exclusivity and rate-cap pairing
            def.credentials()?;
            match (def.rate_limit, def.rate_limit_period) {
                (Some(limit), Some(period)) if limit == 0 || period == 0 => {
                    return Err(ConfigError::ValidationError(format!(
                        "resource {}: rateLimit and rateLimitPeriod must be positive",
                        def.url
                    )));
                }
                (Some(_), None) | (None, Some(_)) => {
                    return Err(ConfigError::ValidationError(format!(
                        "resource {}: rateLimit and rateLimitPeriod must be set together",
                        def.url
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Configuration manager trait
#[async_trait]
pub trait ConfigManager: Send + Sync {
    /// Get the current configuration
    async fn get_config(&self) -> AppConfig;

    /// Load configuration from file
    async fn load_from_file<P: AsRef<Path> + Send>(&self, path: P) -> Result<(), ConfigError>;

    /// Save configuration to file
    async fn save_to_file<P: AsRef<Path> + Send>(&self, path: P) -> Result<(), ConfigError>;

    /// Update configuration
    async fn update_config(&self, config: AppConfig) -> Result<(), ConfigError>;
}

/// Basic implementation of the ConfigManager backed by a JSON file
pub struct BasicConfigManager {
    config: Arc<RwLock<AppConfig>>,
}

impl BasicConfigManager {
    /// Create a new BasicConfigManager with default configuration
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(AppConfig::default())),
        }
    }
}

impl Default for BasicConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigManager for BasicConfigManager {
    async fn get_config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    async fn load_from_file<P: AsRef<Path> + Send>(&self, path: P) -> Result<(), ConfigError> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| ConfigError::LoadError(format!("{}: {}", path.as_ref().display(), e)))?;
        let parsed: AppConfig = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::LoadError(format!("{}: {}", path.as_ref().display(), e)))?;
        parsed.validate()?;

        let mut config = self.config.write().await;
        *config = parsed;
        Ok(())
    }

    async fn save_to_file<P: AsRef<Path> + Send>(&self, path: P) -> Result<(), ConfigError> {
        let config = self.config.read().await;
        let raw = serde_json::to_string_pretty(&*config)
            .map_err(|e| ConfigError::SaveError(e.to_string()))?;
        tokio::fs::write(path.as_ref(), raw)
            .await
            .map_err(|e| ConfigError::SaveError(format!("{}: {}", path.as_ref().display(), e)))
    }

    async fn update_config(&self, config: AppConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let mut current = self.config.write().await;
        *current = config;
        Ok(())
    }
}
