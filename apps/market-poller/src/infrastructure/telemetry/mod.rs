//! Logging and OpenTelemetry Tracing
//!
//! Configures the `tracing` subscriber and, when enabled, an OTLP span
//! exporter. Also provides the default transport fault logger.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: filter directives (default: `market_poller=info`)
//! - `OTEL_ENABLED`: set to "true" to export spans (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4317)
//! - `OTEL_SERVICE_NAME`: service name for traces (default: market-poller)
//!
//! # Usage
//!
//! ```ignore
//! use market_poller::infrastructure::telemetry;
//!
//! // Keep the guard alive for the duration of the program.
//! let _guard = telemetry::init()?;
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

use crate::application::ports::{FaultLogger, TransportFault};

/// Service name for OpenTelemetry traces.
const DEFAULT_SERVICE_NAME: &str = "market-poller";

/// Default OTLP endpoint.
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_DIRECTIVES: &str = "market_poller=info";

/// Errors raised while installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The default filter directives are invalid.
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),

    /// The OTLP exporter could not be built.
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(String),

    /// A global subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] TryInitError),
}

/// Guard that shuts down OpenTelemetry when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shutdown OpenTelemetry tracer provider: {e}");
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Whether spans are exported.
    pub enabled: bool,
    /// OTLP exporter endpoint.
    pub otlp_endpoint: String,
    /// Service name for traces.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let enabled = std::env::var("OTEL_ENABLED")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_OTLP_ENDPOINT.to_string());

        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string());

        Self {
            enabled,
            otlp_endpoint,
            service_name,
        }
    }
}

/// Initialize telemetry from the environment.
///
/// # Errors
///
/// See [`init_with_config`].
pub fn init() -> Result<TelemetryGuard, TelemetryError> {
    init_with_config(TelemetryConfig::from_env())
}

/// Initialize telemetry with custom configuration.
///
/// Returns a guard that must be kept alive for the duration of the program.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or a global subscriber
/// is already installed.
pub fn init_with_config(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_DIRECTIVES))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;

        return Ok(TelemetryGuard {
            tracer_provider: None,
        });
    }

    let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(otlp_exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build();

    let tracer = tracer_provider.tracer(config.service_name);
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(TelemetryGuard {
        tracer_provider: Some(tracer_provider),
    })
}

// =============================================================================
// Fault Logger
// =============================================================================

/// Writes transport faults as `warn` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFaultLogger;

impl FaultLogger for TracingFaultLogger {
    fn log(&self, fault: &TransportFault, context: &str) {
        tracing::warn!(context, error = %fault, "Transport fault");
    }
}

// =============================================================================
// Tests
// =============================================================================
