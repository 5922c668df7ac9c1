//! Market books and runners.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::PolledItem;

/// Lifecycle status of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    /// Not yet open for betting.
    Inactive,
    /// Open for betting.
    Open,
    /// Temporarily suspended.
    Suspended,
    /// Settled or voided.
    Closed,
}

impl MarketStatus {
    /// Whether no further updates will be published for the market.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Inactive)
    }
}

/// Status of a single runner within a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerStatus {
    /// Still running.
    Active,
    /// Won the market.
    Winner,
    /// Lost the market.
    Loser,
    /// Withdrawn before the off.
    Removed,
    /// Dead heat or placed.
    Placed,
    /// Hidden by the exchange.
    Hidden,
}

/// One selection within a market book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runner {
    /// Selection id, unique within the market.
    pub selection_id: i64,
    /// Handicap for Asian markets.
    #[serde(default)]
    pub handicap: f64,
    /// Runner status.
    pub status: RunnerStatus,
    /// Price of the most recent match.
    #[serde(default)]
    pub last_price_traded: Option<Decimal>,
    /// Amount matched on this runner.
    #[serde(default)]
    pub total_matched: Option<Decimal>,
}

/// Snapshot of one market's prices and state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketBook {
    /// Market id.
    pub market_id: String,
    /// Market status.
    pub status: MarketStatus,
    /// Whether the market is in play.
    #[serde(default)]
    pub inplay: bool,
    /// Version counter incremented by the exchange on every change.
    #[serde(default)]
    pub version: i64,
    /// Amount matched across the market.
    #[serde(default)]
    pub total_matched: Option<Decimal>,
    /// Time of the most recent match.
    #[serde(default)]
    pub last_match_time: Option<DateTime<Utc>>,
    /// Runners in the market.
    #[serde(default)]
    pub runners: Vec<Runner>,
}

impl MarketBook {
    /// Find a runner by selection id.
    #[must_use]
    pub fn runner(&self, selection_id: i64) -> Option<&Runner> {
        self.runners.iter().find(|r| r.selection_id == selection_id)
    }
}

impl PolledItem for MarketBook {
    fn subscriber_id(&self) -> &str {
        &self.market_id
    }

    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// =============================================================================
// Projections
// =============================================================================

/// Price data categories requested from the market book endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceData {
    /// Starting price base data.
    SpAvailable,
    /// Starting price traded data.
    SpTraded,
    /// Best three prices on each side.
    ExBestOffers,
    /// Full available ladder.
    ExAllOffers,
    /// Traded volume ladder.
    ExTraded,
}

/// Which prices to include in each market book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceProjection {
    /// Requested price data.
    pub price_data: BTreeSet<PriceData>,
    /// Roll up virtual bets into the ladder.
    #[serde(default)]
    pub virtualise: bool,
}

impl PriceProjection {
    /// Projection for the best offers and traded volume.
    #[must_use]
    pub fn best_offers() -> Self {
        Self {
            price_data: [PriceData::ExBestOffers, PriceData::ExTraded]
                .into_iter()
                .collect(),
            virtualise: true,
        }
    }
}

/// Which of the caller's orders to include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderProjection {
    /// All orders.
    All,
    /// Unmatched orders only.
    Executable,
    /// Fully matched orders only.
    ExecutionComplete,
}

/// How matched amounts are rolled up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchProjection {
    /// One entry per match.
    NoRollup,
    /// Rolled up by price.
    RolledUpByPrice,
    /// Rolled up by average price.
    RolledUpByAvgPrice,
}

/// Parameters sent with every market book request of a live listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookProjection {
    /// Price projection.
    pub price: PriceProjection,
    /// Order projection.
    #[serde(default)]
    pub order: Option<OrderProjection>,
    /// Match projection.
    #[serde(default)]
    pub matched: Option<MatchProjection>,
}

impl BookProjection {
    /// Projection with prices only.
    #[must_use]
    pub const fn prices(price: PriceProjection) -> Self {
        Self {
            price,
            order: None,
            matched: None,
        }
    }
}
