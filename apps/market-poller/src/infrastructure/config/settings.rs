//! Poller Configuration Settings
//!
//! Configuration types for the listeners and the demo binary, loaded from
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::services::MultiplexerConfig;

/// Listener settings shared by every multiplexer in the process.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Per-id broadcast buffer. Slow consumers skip ahead past this many
    /// undelivered notifications.
    pub channel_capacity: usize,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

impl ListenerSettings {
    /// Multiplexer configuration labelled `name` in logs and metrics.
    #[must_use]
    pub fn multiplexer_config(&self, name: impl Into<String>) -> MultiplexerConfig {
        MultiplexerConfig {
            name: name.into(),
            channel_capacity: self.channel_capacity,
        }
    }
}

/// Interval flip-flop settings of the demo binary.
#[derive(Debug, Clone)]
pub struct DemoSettings {
    /// Interval of the first subscription, in seconds.
    pub default_interval_secs: f64,
    /// Interval of the second subscription, in seconds.
    pub alt_interval_secs: f64,
    /// How often the two subscriptions swap intervals.
    pub flip_period: Duration,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            default_interval_secs: 1.0,
            alt_interval_secs: 2.5,
            flip_period: Duration::from_secs(20),
        }
    }
}

/// Metrics exporter settings.
#[derive(Debug, Clone)]
pub struct MetricsSettings {
    /// Prometheus metrics port (0 = disabled).
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { port: 9090 }
    }
}

impl MetricsSettings {
    /// Whether the exporter should be started.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.port != 0
    }
}

/// Complete poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Listener settings.
    pub listener: ListenerSettings,
    /// Demo settings.
    pub demo: DemoSettings,
    /// Metrics settings.
    pub metrics: MetricsSettings,
    /// Recorded market book frames replayed by the demo.
    pub replay_file: PathBuf,
}

impl PollerConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `MARKET_POLLER_REPLAY_FILE` is missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// Unparseable numeric values fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `MARKET_POLLER_REPLAY_FILE` is missing or empty.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let replay_file = lookup("MARKET_POLLER_REPLAY_FILE")
            .ok_or_else(|| ConfigError::MissingEnvVar("MARKET_POLLER_REPLAY_FILE".to_string()))?;

        if replay_file.trim().is_empty() {
            return Err(ConfigError::EmptyValue(
                "MARKET_POLLER_REPLAY_FILE".to_string(),
            ));
        }

        let listener = ListenerSettings {
            channel_capacity: parse_env_usize(
                &lookup,
                "MARKET_POLLER_CHANNEL_CAPACITY",
                ListenerSettings::default().channel_capacity,
            ),
        };

        let demo = DemoSettings {
            default_interval_secs: parse_env_f64(
                &lookup,
                "MARKET_POLLER_DEFAULT_INTERVAL_SECS",
                DemoSettings::default().default_interval_secs,
            ),
            alt_interval_secs: parse_env_f64(
                &lookup,
                "MARKET_POLLER_ALT_INTERVAL_SECS",
                DemoSettings::default().alt_interval_secs,
            ),
            flip_period: parse_env_duration_secs(
                &lookup,
                "MARKET_POLLER_FLIP_SECS",
                DemoSettings::default().flip_period,
            ),
        };

        let metrics = MetricsSettings {
            port: parse_env_u16(
                &lookup,
                "MARKET_POLLER_METRICS_PORT",
                MetricsSettings::default().port,
            ),
        };

        Ok(Self {
            listener,
            demo,
            metrics,
            replay_file: PathBuf::from(replay_file),
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_env_u16(lookup: impl Fn(&str) -> Option<String>, key: &str, default: u16) -> u16 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(lookup: impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

fn parse_env_f64(lookup: impl Fn(&str) -> Option<String>, key: &str, default: f64) -> f64 {
    lookup(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn parse_env_duration_secs(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&v| v > 0)
        .map_or(default, Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn replay_file_is_required() {
        let err = PollerConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "MARKET_POLLER_REPLAY_FILE"));

        let err = PollerConfig::from_lookup(lookup(&[("MARKET_POLLER_REPLAY_FILE", "  ")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(_)));
    }

    #[test]
    fn defaults_apply() {
        let config =
            PollerConfig::from_lookup(lookup(&[("MARKET_POLLER_REPLAY_FILE", "frames.json")]))
                .unwrap();

        assert_eq!(config.replay_file, PathBuf::from("frames.json"));
        assert_eq!(config.listener.channel_capacity, 64);
        assert!((config.demo.default_interval_secs - 1.0).abs() < f64::EPSILON);
        assert!((config.demo.alt_interval_secs - 2.5).abs() < f64::EPSILON);
        assert_eq!(config.demo.flip_period, Duration::from_secs(20));
        assert_eq!(config.metrics.port, 9090);
        assert!(config.metrics.is_enabled());
    }

    #[test]
    fn overrides_apply() {
        let config = PollerConfig::from_lookup(lookup(&[
            ("MARKET_POLLER_REPLAY_FILE", "frames.json"),
            ("MARKET_POLLER_CHANNEL_CAPACITY", "8"),
            ("MARKET_POLLER_DEFAULT_INTERVAL_SECS", "0.5"),
            ("MARKET_POLLER_FLIP_SECS", "5"),
            ("MARKET_POLLER_METRICS_PORT", "0"),
        ]))
        .unwrap();

        assert_eq!(config.listener.channel_capacity, 8);
        assert!((config.demo.default_interval_secs - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.demo.flip_period, Duration::from_secs(5));
        assert!(!config.metrics.is_enabled());
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = PollerConfig::from_lookup(lookup(&[
            ("MARKET_POLLER_REPLAY_FILE", "frames.json"),
            ("MARKET_POLLER_CHANNEL_CAPACITY", "0"),
            ("MARKET_POLLER_ALT_INTERVAL_SECS", "NaN"),
            ("MARKET_POLLER_METRICS_PORT", "not-a-port"),
        ]))
        .unwrap();

        assert_eq!(config.listener.channel_capacity, 64);
        assert!((config.demo.alt_interval_secs - 2.5).abs() < f64::EPSILON);
        assert_eq!(config.metrics.port, 9090);
    }

    #[test]
    fn zero_flip_period_falls_back() {
        let config = PollerConfig::from_lookup(lookup(&[
            ("MARKET_POLLER_REPLAY_FILE", "frames.json"),
            ("MARKET_POLLER_FLIP_SECS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.demo.flip_period, Duration::from_secs(20));
        assert!(!config.demo.flip_period.is_zero());
    }

    #[test]
    fn multiplexer_config_carries_capacity() {
        let settings = ListenerSettings {
            channel_capacity: 16,
        };

        let config = settings.multiplexer_config("books");

        assert_eq!(config.name, "books");
        assert_eq!(config.channel_capacity, 16);
    }
}
