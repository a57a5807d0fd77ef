//! Tracing setup for the runtime binary and embedders.
//!
//! The environment wins over the config document: `RUST_LOG` replaces
//! `observability.log_level` and `AGENT_LOG_FORMAT` replaces
//! `observability.json_logs`.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::ObservabilityConfig;

const FORMAT_ENV: &str = "AGENT_LOG_FORMAT";
const FALLBACK_LEVEL: &str = "info";

static TRACING_INIT: OnceLock<LogFormat> = OnceLock::new();

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// `json` (any case) selects JSON, any other value selects compact text,
    /// and an unset variable defers to the config flag.
    pub fn resolve(env_value: Option<&str>, json_logs: bool) -> Self {
        match env_value {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            Some(_) => LogFormat::Compact,
            None if json_logs => LogFormat::Json,
            None => LogFormat::Compact,
        }
    }
}

/// Filter from `RUST_LOG`, else the configured level. An unparsable level
/// falls back to `info`.
fn build_filter(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.as_str()))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}

/// Install the subscriber with default settings.
pub fn init_tracing() -> LogFormat {
    init_tracing_with(&ObservabilityConfig::default())
}

/// Install the subscriber once per process. Later calls are no-ops and
/// return the format chosen by the first one.
pub fn init_tracing_with(config: &ObservabilityConfig) -> LogFormat {
    *TRACING_INIT.get_or_init(|| {
        let env_format = std::env::var(FORMAT_ENV).ok();
        let format = LogFormat::resolve(env_format.as_deref(), config.json_logs);
        let filter = build_filter(config);

        let installed = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_current_span(false))
                .try_init(),
            LogFormat::Compact => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_target(true))
                .try_init(),
        };
        if let Err(err) = installed {
            // Another subscriber (an embedder's or a test harness's) is active.
            eprintln!("tracing init skipped: {err}");
        }
        format
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_format_overrides_config() {
        assert_eq!(LogFormat::resolve(Some("JSON"), false), LogFormat::Json);
        assert_eq!(LogFormat::resolve(Some("text"), true), LogFormat::Compact);
    }

    #[test]
    fn test_config_flag_used_without_env() {
        assert_eq!(LogFormat::resolve(None, true), LogFormat::Json);
        assert_eq!(LogFormat::resolve(None, false), LogFormat::Compact);
    }

    #[test]
    fn test_init_is_idempotent() {
        let first = init_tracing();
        let json = ObservabilityConfig {
            json_logs: !matches!(first, LogFormat::Json),
            ..ObservabilityConfig::default()
        };
        assert_eq!(init_tracing_with(&json), first);
    }
}
