#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Market Poller - Interval-Multiplexed Polling Listeners
//!
//! Turns a request/response market data API into per-market streams.
//! Subscribers ask for a market at a poll interval; subscribers sharing an
//! interval share one timer and one batched request per tick, and every
//! response is fanned out to the streams of the ids it contains.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Polling rules and the market data model
//!   - `interval`: Clamped poll intervals
//!   - `freshness`: Stale-response watermark
//!   - `subscription`: Interval bucket membership
//!   - `streaming`: Notifications and the polled item contract
//!   - `market`: Market books, runners, catalogues
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Batch sources, exchange clients, fault logging
//!   - `services`: Multiplexer, derived streams, catalogue listener
//!
//! - **Infrastructure**: Adapters and runtime plumbing
//!   - `poller`: Per-bucket timers
//!   - `broadcast`: Shared per-id streams
//!   - `source`: Live and pluggable batch sources
//!   - `replay`: Recorded market books
//!   - `config`, `telemetry`, `metrics`: Ambient stack
//!
//! # Data Flow
//!
//! ```text
//!             ┌──────────────┐  tick   ┌─────────────┐
//! bucket 1s ──┤   Poller     ├────────►│ BatchSource │
//!             └──────────────┘         └──────┬──────┘
//!                                             │ items
//!                                   ┌─────────▼─────────┐
//!                                   │ watermark + route │
//!                                   └─────────┬─────────┘
//!                      ┌──────────────────────┼──────────────────────┐
//!                      ▼                      ▼                      ▼
//!               stream "1.101"         stream "1.102"         stream "1.103"
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Polling rules and market types with no runtime dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and runtime plumbing.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::interval::{
    IntervalError, MAX_POLL_INTERVAL_SECS, MIN_POLL_INTERVAL_SECS, PollInterval,
};
pub use domain::market::{
    BookProjection, CatalogueFilter, FilterId, MarketBook, MarketCatalogue, MarketFilter,
    MarketStatus, Runner,
};
pub use domain::streaming::{ApplicationError, ListenerError, Notification, PolledItem};
pub use domain::subscription::SubscriberId;

// Ports
pub use application::ports::{
    BatchResponse, BatchSource, CatalogueClient, FaultLogger, MarketBookClient, TransportFault,
    TransportFaults,
};

// Listeners
pub use application::services::{
    CatalogueBatch, CatalogueListener, MarketListener, Multiplexer, MultiplexerConfig,
    MultiplexerError, MultiplexerStats, RunnerUpdate, SubscriptionHandle, derive_stream,
    runner_stream,
};

// Streams
pub use infrastructure::broadcast::{Consumer, SharedStream};

// Infrastructure config
pub use infrastructure::config::{ConfigError, PollerConfig};

// Replay
pub use infrastructure::replay::{ReplayError, ReplayFeed};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryGuard, TracingFaultLogger, init as init_telemetry,
};
