//! Prometheus Metrics Module
//!
//! Exposes poller metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Ticks**: fetch cycles run per listener
//! - **Outcomes**: transport faults, application errors, stale responses
//! - **Delivery**: items delivered and subscriptions completed
//! - **State**: active buckets and subscriptions
//! - **Latency**: remote call duration
//!
//! Recording functions are no-ops until a recorder is installed, so the
//! library can be used without metrics.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// =============================================================================
// Exporter
// =============================================================================

static EXPORTER_PORT: OnceLock<u16> = OnceLock::new();

/// Errors raised when installing the exporter.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The recorder or HTTP listener could not be installed.
    #[error("failed to install Prometheus exporter: {0}")]
    Install(#[from] BuildError),
}

/// Install the Prometheus recorder with an HTTP listener on `port`.
///
/// Must be called from within a tokio runtime. Repeated calls are no-ops.
///
/// # Errors
///
/// Returns an error if the recorder is already installed by another
/// component or the listener cannot be bound.
pub fn init_metrics(port: u16) -> Result<(), MetricsError> {
    if EXPORTER_PORT.get().is_some() {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .install()?;

    register_metrics();
    let _ = EXPORTER_PORT.set(port);
    Ok(())
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_poller_ticks_total",
        "Fetch cycles run, by listener and interval"
    );
    describe_counter!(
        "market_poller_fetch_faults_total",
        "Transport faults raised by fetches"
    );
    describe_counter!(
        "market_poller_application_errors_total",
        "Responses rejected by the remote API"
    );
    describe_counter!(
        "market_poller_stale_responses_total",
        "Responses dropped by the freshness watermark"
    );
    describe_counter!(
        "market_poller_items_delivered_total",
        "Items delivered to subscribers"
    );
    describe_counter!(
        "market_poller_completions_total",
        "Subscriptions completed by a terminal item"
    );

    describe_gauge!(
        "market_poller_active_buckets",
        "Poll interval buckets with a running poller"
    );
    describe_gauge!(
        "market_poller_active_subscriptions",
        "Subscriber ids with a live stream"
    );

    describe_histogram!(
        "market_poller_fetch_duration_seconds",
        "Wall-clock duration of remote fetches"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Kind of fetch outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Transport fault; tick aborted.
    Fault,
    /// Application error; bucket failed.
    Rejected,
    /// Superseded response.
    Stale,
}

impl Outcome {
    const fn metric(self) -> &'static str {
        match self {
            Self::Fault => "market_poller_fetch_faults_total",
            Self::Rejected => "market_poller_application_errors_total",
            Self::Stale => "market_poller_stale_responses_total",
        }
    }
}

/// Record one fetch cycle.
pub fn record_tick(listener: &str, interval_secs: f64) {
    counter!(
        "market_poller_ticks_total",
        "listener" => listener.to_string(),
        "interval" => interval_secs.to_string()
    )
    .increment(1);
}

/// Record a fetch that did not deliver.
pub fn record_outcome(listener: &str, outcome: Outcome, count: u64) {
    counter!(outcome.metric(), "listener" => listener.to_string()).increment(count);
}

/// Record items delivered to subscribers.
pub fn record_delivered(listener: &str, count: u64) {
    counter!(
        "market_poller_items_delivered_total",
        "listener" => listener.to_string()
    )
    .increment(count);
}

/// Record a subscription completed by a terminal item.
pub fn record_completed(listener: &str) {
    counter!(
        "market_poller_completions_total",
        "listener" => listener.to_string()
    )
    .increment(1);
}

/// Update the active bucket count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_buckets(listener: &str, count: usize) {
    gauge!(
        "market_poller_active_buckets",
        "listener" => listener.to_string()
    )
    .set(count as f64);
}

/// Update the active subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(listener: &str, count: usize) {
    gauge!(
        "market_poller_active_subscriptions",
        "listener" => listener.to_string()
    )
    .set(count as f64);
}

/// Record a remote fetch duration.
pub fn record_fetch_duration(listener: &str, duration: Duration) {
    histogram!(
        "market_poller_fetch_duration_seconds",
        "listener" => listener.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
