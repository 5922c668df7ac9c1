//! Market catalogues and catalogue filters.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Default number of catalogues requested per filter.
pub const DEFAULT_MAX_RESULTS: u32 = 25;

/// Identity of a registered catalogue filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterId(String);

impl FilterId {
    /// Create a filter id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Range start.
    pub from: DateTime<Utc>,
    /// Range end.
    pub to: DateTime<Utc>,
}

/// Market selection criteria sent to the catalogue endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFilter {
    /// Event type ids (e.g. `"7"` for horse racing).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_type_ids: Vec<String>,
    /// ISO country codes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub market_countries: Vec<String>,
    /// Market type codes (e.g. `"WIN"`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub market_type_codes: Vec<String>,
    /// Restrict to in-play markets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_play_only: Option<bool>,
    /// Market start time window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_start_time: Option<TimeRange>,
}

/// Optional catalogue sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketProjection {
    /// Competition details.
    Competition,
    /// Event details.
    Event,
    /// Event type details.
    EventType,
    /// Market start time.
    MarketStartTime,
    /// Market description.
    MarketDescription,
    /// Runner descriptions.
    RunnerDescription,
    /// Runner metadata.
    RunnerMetadata,
}

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketSort {
    /// Lowest matched first.
    MinimumTraded,
    /// Highest matched first.
    MaximumTraded,
    /// Lowest available first.
    MinimumAvailable,
    /// Highest available first.
    MaximumAvailable,
    /// Earliest start first.
    #[default]
    FirstToStart,
    /// Latest start first.
    LastToStart,
}

/// A catalogue query registered with the catalogue listener.
///
/// The market start window is kept relative to the time the filter was
/// built, so a filter for "markets starting in the next two hours" keeps
/// meaning that on every poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogueFilter {
    /// Identity of this filter.
    pub id: FilterId,
    /// Sections to include.
    pub projection: BTreeSet<MarketProjection>,
    /// Maximum catalogues per request.
    pub max_results: u32,
    /// Ordering of results.
    pub sort: Option<MarketSort>,
    base: MarketFilter,
    window: Option<(TimeDelta, TimeDelta)>,
}

impl CatalogueFilter {
    /// Filter built from `base`, with its start-time window converted to
    /// offsets from `now`.
    #[must_use]
    pub fn new(id: FilterId, base: MarketFilter, now: DateTime<Utc>) -> Self {
        let window = base
            .market_start_time
            .map(|range| (range.from - now, range.to - now));

        Self {
            id,
            projection: BTreeSet::new(),
            max_results: DEFAULT_MAX_RESULTS,
            sort: Some(MarketSort::default()),
            base,
            window,
        }
    }

    /// Filter whose window is `[now + start, now + end]` on every poll.
    #[must_use]
    pub fn rolling(id: FilterId, base: MarketFilter, start: TimeDelta, end: TimeDelta) -> Self {
        Self {
            window: Some((start, end)),
            ..Self::new(id, base, Utc::now())
        }
    }

    /// Set the projection.
    #[must_use]
    pub fn with_projection(mut self, projection: impl IntoIterator<Item = MarketProjection>) -> Self {
        self.projection = projection.into_iter().collect();
        self
    }

    /// Set the result limit.
    #[must_use]
    pub const fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results;
        self
    }

    /// The market filter to send for a request issued at `now`.
    #[must_use]
    pub fn market_filter(&self, now: DateTime<Utc>) -> MarketFilter {
        let mut filter = self.base.clone();
        if let Some((start, end)) = self.window {
            filter.market_start_time = Some(TimeRange {
                from: now + start,
                to: now + end,
            });
        }
        filter
    }
}

/// Static description of a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerCatalog {
    /// Selection id.
    pub selection_id: i64,
    /// Runner name.
    pub runner_name: String,
    /// Display order.
    #[serde(default)]
    pub sort_priority: i32,
}

/// Static description of a market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketCatalogue {
    /// Market id.
    pub market_id: String,
    /// Market name.
    pub market_name: String,
    /// Scheduled start.
    #[serde(default)]
    pub market_start_time: Option<DateTime<Utc>>,
    /// Amount matched.
    #[serde(default)]
    pub total_matched: Option<Decimal>,
    /// Runners, when requested.
    #[serde(default)]
    pub runners: Vec<RunnerCatalog>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap() + TimeDelta::hours(hours)
    }

    #[test]
    fn window_moves_with_now() {
        let base = MarketFilter {
            event_type_ids: vec!["7".to_string()],
            market_start_time: Some(TimeRange {
                from: at(0),
                to: at(2),
            }),
            ..MarketFilter::default()
        };

        let filter = CatalogueFilter::new(FilterId::new("horses"), base, at(0));
        let later = filter.market_filter(at(5));

        assert_eq!(
            later.market_start_time,
            Some(TimeRange {
                from: at(5),
                to: at(7),
            })
        );
        assert_eq!(later.event_type_ids, vec!["7".to_string()]);
    }

    #[test]
    fn filter_without_window_is_unchanged() {
        let base = MarketFilter {
            market_countries: vec!["GB".to_string()],
            ..MarketFilter::default()
        };

        let filter = CatalogueFilter::new(FilterId::new("gb"), base.clone(), at(0));

        assert_eq!(filter.market_filter(at(3)), base);
    }

    #[test]
    fn defaults() {
        let filter = CatalogueFilter::rolling(
            FilterId::new("greyhounds"),
            MarketFilter::default(),
            TimeDelta::zero(),
            TimeDelta::hours(1),
        );

        assert_eq!(filter.max_results, DEFAULT_MAX_RESULTS);
        assert_eq!(filter.sort, Some(MarketSort::FirstToStart));
        assert!(filter.projection.is_empty());
    }

    #[test]
    fn builder_methods() {
        let filter = CatalogueFilter::new(FilterId::new("x"), MarketFilter::default(), at(0))
            .with_projection([MarketProjection::RunnerDescription, MarketProjection::Event])
            .with_max_results(100);

        assert_eq!(filter.max_results, 100);
        assert_eq!(filter.projection.len(), 2);
    }
}
