//! Market Data Types
//!
//! The subset of the exchange data model the listeners route on: market
//! books (polled per market), their runners, and market catalogues (polled
//! per filter). Field names follow the upstream JSON encoding.

mod book;
mod catalogue;

pub use book::{
    BookProjection, MarketBook, MarketStatus, MatchProjection, OrderProjection, PriceData,
    PriceProjection, Runner, RunnerStatus,
};
pub use catalogue::{
    CatalogueFilter, FilterId, MarketCatalogue, MarketFilter, MarketProjection, MarketSort,
    RunnerCatalog, TimeRange,
};
