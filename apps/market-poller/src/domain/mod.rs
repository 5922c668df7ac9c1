//! Domain Layer - Core polling types and business rules.
//!
//! This layer contains the bucketing, freshness and notification rules of
//! the multiplexer plus the market data model. Nothing here touches the
//! runtime or the network.

/// Poll interval value type.
pub mod interval;

/// Stale-response watermark.
pub mod freshness;

/// Interval bucket membership.
pub mod subscription;

/// Notifications delivered to subscribers.
pub mod streaming;

/// Market books, runners and catalogues.
pub mod market;
