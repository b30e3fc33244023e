// Geospatial resource proxy library

pub mod broker;
pub mod config;
pub mod core;
pub mod error;
pub mod forwarder;
pub mod limiter;
pub mod logging;

// Re-export commonly used types
pub use crate::core::{
    dispatcher::Dispatcher,
    request::{ProxyRequest, RequestEnvelope},
    resource::{Credentials, Resource, ResourceTable},
    response::ProxyResponse,
    server::ProxyServer,
    url::UrlParts,
};
pub use crate::error::{ConfigError, LimiterError, ProxyError, TokenError};
