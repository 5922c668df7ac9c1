//! Application Services
//!
//! - `Multiplexer`: per-interval buckets over one batch source
//! - `derive_stream` / `runner_stream`: views of an existing subscription
//! - `CatalogueListener`: one shared timer over registered filters
//! - `SubscriptionHandle`: callback delivery on a dedicated task

mod catalogue;
mod delivery;
mod derived;
mod multiplexer;

pub use catalogue::{CatalogueBatch, CatalogueListener};
pub use delivery::SubscriptionHandle;
pub use derived::{RunnerUpdate, derive_stream, runner_stream};
pub use multiplexer::{
    MarketListener, Multiplexer, MultiplexerConfig, MultiplexerError, MultiplexerStats,
};
