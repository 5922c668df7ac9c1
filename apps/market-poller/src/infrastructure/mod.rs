//! Infrastructure Layer - Adapters and runtime plumbing.
//!
//! Concrete batch sources, the per-bucket timer, stream fan-out and the
//! ambient stack (configuration, logging, metrics).

/// Shared per-key notification streams.
pub mod broadcast;

/// Environment-driven configuration.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Recurring bucket timers and freshness ordering.
pub mod poller;

/// Recorded market book replay.
pub mod replay;

/// Batch source adapters.
pub mod source;

/// Tracing and OpenTelemetry integration.
pub mod telemetry;
