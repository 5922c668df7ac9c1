//! Freshness Watermark
//!
//! Ticks of a bucket may overlap: when a fetch takes longer than the poll
//! interval, the next tick starts before the previous response has been
//! applied. Every response carries the wall-clock instants bracketing its
//! remote call, and the watermark remembers the bracket of the last
//! response that was applied.
//!
//! # Rule
//!
//! A response is rejected when it was issued **before** the latest known
//! request started **and** finished **after** the latest known request
//! finished. Anything else is accepted and becomes the new watermark.
//!
//! The rule is deliberately two-sided. A response that started later but
//! finished earlier than the applied one is accepted.

use chrono::{DateTime, Utc};

/// Bracket of the most recently applied response for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    request_start: DateTime<Utc>,
    request_finish: DateTime<Utc>,
}

impl Watermark {
    /// Watermark with both bounds at `at`. Pollers start from their
    /// creation time.
    #[must_use]
    pub const fn starting_at(at: DateTime<Utc>) -> Self {
        Self {
            request_start: at,
            request_finish: at,
        }
    }

    /// Watermark with explicit bounds.
    #[must_use]
    pub const fn new(request_start: DateTime<Utc>, request_finish: DateTime<Utc>) -> Self {
        Self {
            request_start,
            request_finish,
        }
    }

    /// Start of the latest applied request.
    #[must_use]
    pub const fn request_start(&self) -> DateTime<Utc> {
        self.request_start
    }

    /// Finish of the latest applied request.
    #[must_use]
    pub const fn request_finish(&self) -> DateTime<Utc> {
        self.request_finish
    }

    /// Whether a response with this bracket is superseded.
    #[must_use]
    pub fn is_stale(&self, request_start: DateTime<Utc>, request_finish: DateTime<Utc>) -> bool {
        request_start < self.request_start && request_finish > self.request_finish
    }

    /// Apply the rule: advance and return `true` when accepted, leave the
    /// watermark untouched and return `false` when stale.
    pub fn advance(&mut self, request_start: DateTime<Utc>, request_finish: DateTime<Utc>) -> bool {
        if self.is_stale(request_start, request_finish) {
            return false;
        }

        self.request_start = request_start;
        self.request_finish = request_finish;
        true
    }
}
