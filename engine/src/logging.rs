//! Logging configuration using tracing.
//!
//! The engine itself only emits `tracing` events; binaries that embed it
//! call `init` (or `init_from` with their `EngineConfig`) once to get them
//! on stderr.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::EngineConfig;

/// Initialize logging with the specified level.
///
/// `RUST_LOG` wins over `level`; an unparsable level falls back to `info`.
/// Returns false if a global subscriber was already installed.
pub fn init(level: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter_for(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok()
}

/// Initialize logging at the configured `log_level`.
pub fn init_from(config: &EngineConfig) -> bool {
    init(&config.log_level)
}

fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let _ = init("debug");
        assert!(!init("info"));
    }

    #[test]
    fn test_init_from_config_is_harmless_after_init() {
        let config = EngineConfig::from_toml("log_level = \"warn\"").expect("Failed to parse config");
        let _ = init("debug");
        assert!(!init_from(&config));
    }

    #[test]
    fn test_filter_uses_configured_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(filter_for("warn").to_string(), "warn");
        assert_eq!(filter_for("engine=loud").to_string(), "info");
    }
}
