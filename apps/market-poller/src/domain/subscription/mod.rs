//! Interval Registry
//!
//! Bucket membership for the multiplexer: which subscriber ids are polled
//! at which interval.
//!
//! # Design
//!
//! The registry tracks:
//! - The set of ids assigned to each poll interval (a bucket)
//! - A reverse index from id to its current interval
//!
//! A bucket exists exactly while its id-set is non-empty. Every mutation
//! reports whether a bucket was created or emptied so the owner can start
//! or stop the bucket's poller in the same critical section.
//!
//! The registry is plain data; the multiplexer guards it with its
//! structural lock.

use std::collections::{HashMap, HashSet};

use crate::domain::interval::PollInterval;

// =============================================================================
// Types
// =============================================================================

/// Opaque key of one polled entity (a market id) or one catalogue filter.
pub type SubscriberId = String;

/// Outcome of assigning an id to an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// The bucket did not exist and was created for this id.
    CreatedBucket,
    /// The id joined an existing bucket.
    JoinedBucket,
    /// The id is already assigned, possibly to another interval.
    AlreadyAssigned(PollInterval),
}

impl Assignment {
    /// Whether the caller must start a poller for the bucket.
    #[must_use]
    pub const fn created_bucket(&self) -> bool {
        matches!(self, Self::CreatedBucket)
    }
}

/// Outcome of removing an id from its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    /// Interval the id was assigned to.
    pub interval: PollInterval,
    /// Whether the bucket became empty and was removed.
    pub emptied_bucket: bool,
}

/// Outcome of moving an id between buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    /// Bucket the id left.
    pub from: Release,
    /// Interval the id joined.
    pub to: PollInterval,
    /// Whether the target bucket was created by this move.
    pub created_bucket: bool,
}

// =============================================================================
// Registry
// =============================================================================

/// Maps poll intervals to the ids polled at that interval.
///
/// # Example
///
/// ```rust
/// use market_poller::domain::interval::PollInterval;
/// use market_poller::domain::subscription::{Assignment, IntervalRegistry};
///
/// let mut registry = IntervalRegistry::new();
/// let fast = PollInterval::new(1.0).unwrap();
///
/// assert_eq!(registry.assign("1.101", fast), Assignment::CreatedBucket);
/// assert_eq!(registry.assign("1.102", fast), Assignment::JoinedBucket);
///
/// let release = registry.release("1.101").unwrap();
/// assert!(!release.emptied_bucket);
///
/// let release = registry.release("1.102").unwrap();
/// assert!(release.emptied_bucket);
/// assert_eq!(registry.bucket_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct IntervalRegistry {
    buckets: HashMap<PollInterval, HashSet<SubscriberId>>,
    index: HashMap<SubscriberId, PollInterval>,
}

impl IntervalRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign an unassigned id to the bucket for `interval`.
    pub fn assign(&mut self, id: &str, interval: PollInterval) -> Assignment {
        if let Some(current) = self.index.get(id) {
            return Assignment::AlreadyAssigned(*current);
        }

        self.index.insert(id.to_string(), interval);

        let bucket = self.buckets.entry(interval).or_default();
        bucket.insert(id.to_string());

        // First member - the caller owns poller creation
        if bucket.len() == 1 {
            Assignment::CreatedBucket
        } else {
            Assignment::JoinedBucket
        }
    }

    /// Remove an id from whichever bucket holds it.
    ///
    /// Returns `None` if the id is not assigned.
    pub fn release(&mut self, id: &str) -> Option<Release> {
        let interval = self.index.remove(id)?;

        let emptied_bucket = match self.buckets.get_mut(&interval) {
            Some(bucket) => {
                bucket.remove(id);
                bucket.is_empty()
            }
            None => true,
        };

        if emptied_bucket {
            self.buckets.remove(&interval);
        }

        Some(Release {
            interval,
            emptied_bucket,
        })
    }

    /// Move an assigned id to the bucket for `to`.
    ///
    /// Returns `None` if the id is not assigned or already polled at `to`.
    pub fn reassign(&mut self, id: &str, to: PollInterval) -> Option<Migration> {
        if self.index.get(id)? == &to {
            return None;
        }

        let from = self.release(id)?;
        let created_bucket = self.assign(id, to).created_bucket();

        Some(Migration {
            from,
            to,
            created_bucket,
        })
    }

    /// Interval an id is currently polled at.
    #[must_use]
    pub fn interval_of(&self, id: &str) -> Option<PollInterval> {
        self.index.get(id).copied()
    }

    /// Ids in the bucket for `interval`, empty if there is no such bucket.
    #[must_use]
    pub fn ids(&self, interval: PollInterval) -> Vec<SubscriberId> {
        self.buckets
            .get(&interval)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Intervals with an active bucket.
    #[must_use]
    pub fn intervals(&self) -> Vec<PollInterval> {
        self.buckets.keys().copied().collect()
    }

    /// Number of active buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of assigned ids across all buckets.
    #[must_use]
    pub fn id_count(&self) -> usize {
        self.index.len()
    }

    /// Get statistics for the registry.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            bucket_count: self.bucket_count(),
            id_count: self.id_count(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of buckets (and therefore pollers).
    pub bucket_count: usize,
    /// Number of subscribed ids.
    pub id_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
