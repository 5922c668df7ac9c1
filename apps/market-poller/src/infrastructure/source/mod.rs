//! Batch Source Adapters
//!
//! Implementations of [`BatchSource`](crate::application::ports::BatchSource):
//!
//! - `LiveBatchSource`: calls a remote market book client with fixed
//!   projection parameters
//! - `PluggableBatchSource`: calls a synchronous function, for tests,
//!   replays and simulations

mod live;
mod pluggable;

pub use live::LiveBatchSource;
pub use pluggable::PluggableBatchSource;
