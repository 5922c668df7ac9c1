//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the listeners and the port interfaces through
//! which they reach the remote exchange.

/// Port interfaces for batch sources, exchange clients and fault logging.
pub mod ports;

/// Listeners, derived streams and callback delivery.
pub mod services;
