//! Live market book source.

use async_trait::async_trait;

use crate::application::ports::{BatchResponse, BatchSource, MarketBookClient, TransportFaults};
use crate::domain::interval::PollInterval;
use crate::domain::market::{BookProjection, MarketBook};
use crate::domain::subscription::SubscriberId;

/// Fetches market books from a remote client, sending the same projection
/// with every request.
#[derive(Debug)]
pub struct LiveBatchSource<C> {
    client: C,
    projection: BookProjection,
}

impl<C: MarketBookClient> LiveBatchSource<C> {
    /// Create a source over `client`.
    #[must_use]
    pub const fn new(client: C, projection: BookProjection) -> Self {
        Self { client, projection }
    }

    /// Projection sent with every request.
    #[must_use]
    pub const fn projection(&self) -> &BookProjection {
        &self.projection
    }
}

#[async_trait]
impl<C: MarketBookClient> BatchSource<MarketBook> for LiveBatchSource<C> {
    async fn fetch(
        &self,
        ids: &[SubscriberId],
        _interval: PollInterval,
    ) -> Result<BatchResponse<MarketBook>, TransportFaults> {
        self.client.list_market_book(ids, &self.projection).await
    }

    fn describe(&self) -> String {
        serde_json::to_string(&self.projection).unwrap_or_else(|_| format!("{:?}", self.projection))
    }
}
