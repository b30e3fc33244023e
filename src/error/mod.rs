use thiserror::Error;

/// Proxy error types
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Request URL could not be parsed: {0}")]
    BadRequest(String),

    #[error("Referrer not allowed: {0}")]
    ReferrerDenied(String),

    #[error("No matching resource for {0}")]
    NoResource(String),

    #[error("Rate limit exceeded for {0}")]
    RateExceeded(String),

    #[error("Rate limiter error: {0}")]
    LimiterUnavailable(#[from] LimiterError),

    #[error("Token acquisition failed: {0}")]
    TokenAcquisitionFailed(#[from] TokenError),

    #[error("Upstream request failed: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream request timed out")]
    UpstreamTimeout,

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// HTTP status code mapping for proxy errors
impl ProxyError {
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::BadRequest(_) => 403,
            ProxyError::ReferrerDenied(_) => 403,
            ProxyError::NoResource(_) => 404,
            ProxyError::RateExceeded(_) => 429,
            ProxyError::LimiterUnavailable(_) => 420,
            ProxyError::TokenAcquisitionFailed(_) => 502,
            ProxyError::UpstreamUnavailable(_) => 502,
            ProxyError::UpstreamTimeout => 502,
            ProxyError::ConfigError(_) => 500,
            ProxyError::IoError(_) => 500,
            ProxyError::InternalError(_) => 500,
        }
    }
}

/// Configuration specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Failed to save configuration: {0}")]
    SaveError(String),
}

/// Rate limiter specific errors
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("Failed to open meter store: {0}")]
    OpenError(String),

    #[error("Meter store query failed: {0}")]
    StoreError(String),

    #[error("No meter row for ({url}, {referrer})")]
    MissingRow { url: String, referrer: String },
}

/// Token broker specific errors.
///
/// Clone is required so concurrent callers attached to a shared in-flight
/// acquisition all observe the same outcome.
#[derive(Debug, Clone, Error)]
pub enum TokenError {
    #[error("Token endpoint request failed: {0}")]
    Request(String),

    #[error("Could not derive a token endpoint: {0}")]
    Endpoint(String),

    #[error("No token in endpoint response: {0}")]
    MissingToken(String),

    #[error("Resource has no exchangeable credentials")]
    NoCredentials,

    #[error("Token acquisition task failed: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(ProxyError::BadRequest("x".to_string()).status_code(), 403);
        assert_eq!(ProxyError::ReferrerDenied("x".to_string()).status_code(), 403);
        assert_eq!(ProxyError::NoResource("x".to_string()).status_code(), 404);
        assert_eq!(ProxyError::RateExceeded("x".to_string()).status_code(), 429);
        assert_eq!(
            ProxyError::LimiterUnavailable(LimiterError::StoreError("x".to_string())).status_code(),
            420
        );
        assert_eq!(
            ProxyError::TokenAcquisitionFailed(TokenError::NoCredentials).status_code(),
            502
        );
        assert_eq!(ProxyError::UpstreamTimeout.status_code(), 502);
        assert_eq!(ProxyError::InternalError("x".to_string()).status_code(), 500);
    }
}
