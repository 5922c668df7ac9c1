//! Poll Interval
//!
//! The grouping key of the multiplexer. Subscribers that ask for the same
//! interval value share one bucket and therefore one upstream request per
//! tick.
//!
//! Intervals are compared by their exact `f64` value, so callers must reuse
//! the same number to land in the same bucket (`1.0` and `1.0000001` are two
//! buckets).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Smallest poll interval accepted, in seconds.
///
/// The upstream market book endpoint allows at most five requests per
/// second per market.
pub const MIN_POLL_INTERVAL_SECS: f64 = 0.2;

/// Largest poll interval accepted, in seconds (one year).
///
/// Timers are scheduled as `now + interval`, which must stay representable.
pub const MAX_POLL_INTERVAL_SECS: f64 = 31_536_000.0;

/// Errors raised when building a [`PollInterval`].
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum IntervalError {
    /// The value was NaN or infinite.
    #[error("poll interval must be finite, got {0}")]
    NotFinite(f64),
    /// The value exceeds [`MAX_POLL_INTERVAL_SECS`].
    #[error("poll interval {0}s is too large")]
    TooLarge(f64),
}

/// A poll interval in seconds, clamped to [`MIN_POLL_INTERVAL_SECS`].
#[derive(Debug, Clone, Copy)]
pub struct PollInterval {
    secs: f64,
}

impl PollInterval {
    /// Build an interval from seconds, clamping to the minimum.
    ///
    /// # Errors
    ///
    /// Returns an error for non-finite values or values above
    /// [`MAX_POLL_INTERVAL_SECS`].
    pub fn new(secs: f64) -> Result<Self, IntervalError> {
        if !secs.is_finite() {
            return Err(IntervalError::NotFinite(secs));
        }

        if secs > MAX_POLL_INTERVAL_SECS {
            return Err(IntervalError::TooLarge(secs));
        }

        let secs = secs.max(MIN_POLL_INTERVAL_SECS);

        Ok(Self { secs })
    }

    /// The minimum interval.
    #[must_use]
    pub const fn min() -> Self {
        Self {
            secs: MIN_POLL_INTERVAL_SECS,
        }
    }

    /// Interval in seconds.
    #[must_use]
    pub const fn as_secs_f64(&self) -> f64 {
        self.secs
    }

    /// Interval as a timer period.
    #[must_use]
    pub fn period(&self) -> Duration {
        // Validated in `new`.
        Duration::from_secs_f64(self.secs)
    }
}

impl PartialEq for PollInterval {
    fn eq(&self, other: &Self) -> bool {
        self.secs.to_bits() == other.secs.to_bits()
    }
}

impl Eq for PollInterval {}

impl Hash for PollInterval {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.secs.to_bits().hash(state);
    }
}

impl fmt::Display for PollInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.secs)
    }
}

impl TryFrom<f64> for PollInterval {
    type Error = IntervalError;

    fn try_from(secs: f64) -> Result<Self, Self::Error> {
        Self::new(secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn small_interval_is_clamped() {
        let interval = PollInterval::new(0.05).unwrap();
        assert_eq!(interval, PollInterval::min());
        assert_eq!(interval.as_secs_f64(), 0.2);
    }

    #[test]
    fn zero_and_negative_are_clamped() {
        assert_eq!(PollInterval::new(0.0).unwrap(), PollInterval::min());
        assert_eq!(PollInterval::new(-0.0).unwrap(), PollInterval::min());
        assert_eq!(PollInterval::new(-3.0).unwrap(), PollInterval::min());
    }

    #[test]
    fn non_finite_rejected() {
        assert!(matches!(
            PollInterval::new(f64::NAN),
            Err(IntervalError::NotFinite(_))
        ));
        assert!(matches!(
            PollInterval::new(f64::INFINITY),
            Err(IntervalError::NotFinite(_))
        ));
    }

    #[test]
    fn huge_interval_rejected() {
        assert!(matches!(
            PollInterval::new(1e30),
            Err(IntervalError::TooLarge(_))
        ));
        assert!(matches!(
            PollInterval::new(1e19),
            Err(IntervalError::TooLarge(_))
        ));
        assert!(matches!(
            PollInterval::new(MAX_POLL_INTERVAL_SECS + 1.0),
            Err(IntervalError::TooLarge(_))
        ));
    }

    #[test]
    fn largest_interval_can_be_scheduled() {
        let interval = PollInterval::new(MAX_POLL_INTERVAL_SECS).unwrap();
        assert!(
            tokio::time::Instant::now()
                .checked_add(interval.period())
                .is_some()
        );
    }

    #[test]
    fn equal_values_share_a_key() {
        let mut set = HashSet::new();
        set.insert(PollInterval::new(1.0).unwrap());
        set.insert(PollInterval::new(1.0).unwrap());
        set.insert(PollInterval::new(2.5).unwrap());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn period_matches_seconds() {
        let interval = PollInterval::new(2.5).unwrap();
        assert_eq!(interval.period(), Duration::from_millis(2500));
        assert_eq!(interval.to_string(), "2.5s");
    }

    proptest! {
        #[test]
        fn never_below_minimum(secs in -1_000.0f64..1_000.0) {
            let interval = PollInterval::new(secs).unwrap();
            prop_assert!(interval.as_secs_f64() >= MIN_POLL_INTERVAL_SECS);
        }

        #[test]
        fn values_above_minimum_are_kept(secs in 0.2f64..86_400.0) {
            let interval = PollInterval::new(secs).unwrap();
            prop_assert_eq!(interval.as_secs_f64().to_bits(), secs.to_bits());
        }
    }
}
