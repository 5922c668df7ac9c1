//! Configuration Module
//!
//! Environment-driven configuration for the listeners and the demo binary.

mod settings;

pub use settings::{ConfigError, DemoSettings, ListenerSettings, MetricsSettings, PollerConfig};
