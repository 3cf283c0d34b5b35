mod metrics;

pub use crate::metrics::{
    install_recorder, render, BUS_RESUBSCRIBES_TOTAL, CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL,
    DELIVERIES_TOTAL, DELIVERY_FAILURES_TOTAL, MESSAGES_RECEIVED_TOTAL, STORE_WRITE_FAILURES_TOTAL,
};
pub use metrics_exporter_prometheus::PrometheusHandle;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    #[error("tracing subscriber already installed: {0}")]
    SubscriberInstalled(String),
    #[error("metrics recorder already installed: {0}")]
    RecorderInstalled(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "relay_bus" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout; otherwise human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Build a config from textual levels, as they appear in settings files.
    pub fn from_names(
        level: &str,
        module_levels: &[(String, String)],
        json: bool,
    ) -> Result<Self, TelemetryError> {
        let log_level = parse_level(level)?;
        let module_levels = module_levels
            .iter()
            .map(|(module, lvl)| Ok((module.clone(), parse_level(lvl)?)))
            .collect::<Result<Vec<_>, TelemetryError>>()?;
        Ok(Self {
            log_level,
            module_levels,
            json,
        })
    }

    /// The `EnvFilter` directive string for this config.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

pub fn parse_level(name: &str) -> Result<Level, TelemetryError> {
    name.trim()
        .parse::<Level>()
        .map_err(|_| TelemetryError::InvalidLevel(name.to_string()))
}

/// Initialize the tracing subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInstalled(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_info_json() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.json);
        assert_eq!(config.filter_directives(), "info");
    }

    #[test]
    fn module_levels_appear_in_directives() {
        let config = TelemetryConfig::from_names(
            "warn",
            &[("relay_bus".into(), "debug".into())],
            false,
        )
        .unwrap();
        assert_eq!(config.filter_directives(), "warn,relay_bus=debug");
    }

    #[test]
    fn parse_level_is_case_insensitive() {
        assert_eq!(parse_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_level(" trace ").unwrap(), Level::TRACE);
    }

    #[test]
    fn parse_level_rejects_unknown() {
        let err = parse_level("loud").unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidLevel(ref s) if s == "loud"));
    }

    #[test]
    fn init_twice_reports_error() {
        let config = TelemetryConfig {
            json: false,
            ..TelemetryConfig::default()
        };
        // Another test in this binary may have won the race; either way the
        // second call must fail rather than panic.
        let _ = init_telemetry(&config);
        assert!(init_telemetry(&config).is_err());
    }
}
