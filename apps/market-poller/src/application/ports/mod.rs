//! Port Interfaces
//!
//! Contracts between the listeners and the outside world, following the
//! hexagonal layout of the rest of the workspace.
//!
//! ## Driven Ports (Outbound)
//!
//! - `BatchSource`: fetches one batch for the ids of a bucket
//! - `MarketBookClient`: remote market book endpoint used by live sources
//! - `CatalogueClient`: remote market catalogue endpoint
//! - `FaultLogger`: fire-and-forget sink for transport faults

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::interval::PollInterval;
use crate::domain::market::{
    BookProjection, MarketBook, MarketCatalogue, MarketFilter, MarketProjection, MarketSort,
};
use crate::domain::streaming::ApplicationError;
use crate::domain::subscription::SubscriberId;

// =============================================================================
// Responses and Faults
// =============================================================================

/// Result of one remote call for a set of ids.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResponse<T> {
    /// Items returned, in any order.
    pub items: Vec<T>,
    /// Wall-clock instant the request was issued.
    pub request_start: DateTime<Utc>,
    /// Wall-clock instant the response was received.
    pub request_finish: DateTime<Utc>,
    /// Server-side rejection carried by an otherwise successful call.
    pub error: Option<ApplicationError>,
}

impl<T> BatchResponse<T> {
    /// Successful response.
    #[must_use]
    pub const fn ok(
        items: Vec<T>,
        request_start: DateTime<Utc>,
        request_finish: DateTime<Utc>,
    ) -> Self {
        Self {
            items,
            request_start,
            request_finish,
            error: None,
        }
    }

    /// Response carrying an application error and no items.
    #[must_use]
    pub const fn rejected(
        error: ApplicationError,
        request_start: DateTime<Utc>,
        request_finish: DateTime<Utc>,
    ) -> Self {
        Self {
            items: Vec::new(),
            request_start,
            request_finish,
            error: Some(error),
        }
    }
}

/// A single transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFault {
    /// Could not reach the endpoint.
    #[error("connection failed: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// The call did not complete in time.
    #[error("request timed out: {message}")]
    Timeout {
        /// Error details.
        message: String,
    },

    /// The response could not be decoded.
    #[error("malformed response: {message}")]
    Decode {
        /// Error details.
        message: String,
    },

    /// The endpoint returned an unexpected HTTP status.
    #[error("unexpected status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error details.
        message: String,
    },
}

/// One or more transport faults raised by a single fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} transport fault(s)", .0.len())]
pub struct TransportFaults(pub Vec<TransportFault>);

impl TransportFaults {
    /// Iterate over the contained faults.
    pub fn iter(&self) -> std::slice::Iter<'_, TransportFault> {
        self.0.iter()
    }
}

impl From<TransportFault> for TransportFaults {
    fn from(fault: TransportFault) -> Self {
        Self(vec![fault])
    }
}

// =============================================================================
// Driven Ports
// =============================================================================

/// Fetches one batch for all ids of a bucket.
///
/// A transport failure aborts the tick. An [`ApplicationError`] inside an
/// `Ok` response fails every subscription of the bucket.
#[async_trait]
pub trait BatchSource<T>: Send + Sync {
    /// Fetch the current items for `ids`.
    async fn fetch(
        &self,
        ids: &[SubscriberId],
        interval: PollInterval,
    ) -> Result<BatchResponse<T>, TransportFaults>;

    /// Request parameters included in fault log context.
    fn describe(&self) -> String {
        String::new()
    }
}

/// Remote market book endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketBookClient: Send + Sync {
    /// Fetch books for the given market ids.
    async fn list_market_book(
        &self,
        market_ids: &[SubscriberId],
        projection: &BookProjection,
    ) -> Result<BatchResponse<MarketBook>, TransportFaults>;
}

/// Remote market catalogue endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogueClient: Send + Sync {
    /// Fetch catalogues matching a filter.
    async fn list_market_catalogue(
        &self,
        filter: &MarketFilter,
        projection: &BTreeSet<MarketProjection>,
        sort: Option<MarketSort>,
        max_results: u32,
    ) -> Result<BatchResponse<MarketCatalogue>, TransportFaults>;
}

/// Sink for transport faults.
#[cfg_attr(test, mockall::automock)]
pub trait FaultLogger: Send + Sync {
    /// Record one fault with a description of where it happened.
    fn log(&self, fault: &TransportFault, context: &str);
}
