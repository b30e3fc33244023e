use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::LoggingConfig;

/// Initialize the tracing system. `RUST_LOG` wins when set; otherwise the
/// configured level applies.
pub fn init_tracing(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        match config.level.as_str() {
            "trace" => EnvFilter::new("trace"),
            "debug" => EnvFilter::new("debug"),
            "info" => EnvFilter::new("info"),
            "warn" => EnvFilter::new("warn"),
            "error" => EnvFilter::new("error"),
            _ => EnvFilter::new("info"),
        }
    });

    if config.json_format {
        let fmt_layer = fmt::layer().with_target(true).json();
        Registry::default().with(env_filter).with(fmt_layer).init();
    } else {
        let fmt_layer = fmt::layer().with_target(true);
        Registry::default().with(env_filter).with(fmt_layer).init();
    }

    tracing::info!("Tracing system initialized");
}
