//! Recorded Market Replay
//!
//! Serves market books from a recorded JSON file instead of the exchange.
//! The file holds a list of frames, each frame a list of market books:
//!
//! ```json
//! [
//!   [{ "marketId": "1.1", "status": "OPEN", "runners": [] }],
//!   [{ "marketId": "1.1", "status": "CLOSED", "runners": [] }]
//! ]
//! ```
//!
//! Every market keeps its own cursor. Each request for a market returns
//! its next recorded book; after the last one the final book repeats.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use thiserror::Error;

use crate::domain::market::MarketBook;
use crate::domain::subscription::SubscriberId;

/// Errors loading a replay file.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The file could not be read.
    #[error("failed to read replay file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not a list of market book frames.
    #[error("invalid replay file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-market sequences of recorded books.
#[derive(Debug)]
pub struct ReplayFeed {
    histories: HashMap<String, Vec<MarketBook>>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl ReplayFeed {
    /// Load a replay file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse replay frames from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is not a list of frames.
    pub fn from_json(json: &str) -> Result<Self, ReplayError> {
        let frames: Vec<Vec<MarketBook>> = serde_json::from_str(json)?;
        Ok(Self::from_frames(frames))
    }

    /// Build a feed from frames in recorded order.
    #[must_use]
    pub fn from_frames(frames: Vec<Vec<MarketBook>>) -> Self {
        let mut histories: HashMap<String, Vec<MarketBook>> = HashMap::new();
        for book in frames.into_iter().flatten() {
            histories
                .entry(book.market_id.clone())
                .or_default()
                .push(book);
        }

        tracing::info!(markets = histories.len(), "Replay feed loaded");
        Self {
            histories,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Recorded market ids, sorted.
    #[must_use]
    pub fn market_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.histories.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The next book of every requested market. Unknown markets are
    /// skipped.
    pub fn next_for(&self, ids: &[SubscriberId]) -> Vec<MarketBook> {
        let mut cursors = self.cursors.lock();
        ids.iter()
            .filter_map(|id| {
                let history = self.histories.get(id)?;
                let cursor = cursors.entry(id.clone()).or_insert(0);
                let book = history.get(*cursor).or_else(|| history.last())?;
                if *cursor < history.len() {
                    *cursor += 1;
                }
                Some(book.clone())
            })
            .collect()
    }
}
