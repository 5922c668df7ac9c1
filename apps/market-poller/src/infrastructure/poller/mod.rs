//! Bucket Poller
//!
//! A recurring timer driving one bucket plus the bucket's freshness
//! watermark. Each tick is spawned on its own task, so a slow fetch never
//! delays the next tick; overlapping responses are ordered by the
//! watermark instead.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::domain::freshness::Watermark;

/// Outcome of offering a response to a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission<R> {
    /// The response was accepted and delivered.
    Delivered(R),
    /// The response was superseded and dropped.
    Stale,
    /// The poller was stopped before the response arrived.
    Stopped,
}

/// State shared between a poller's timer task and its in-flight ticks.
#[derive(Debug)]
pub struct PollerState {
    watermark: Mutex<Watermark>,
    cancel: CancellationToken,
}

impl PollerState {
    /// State with the watermark at `at`.
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            watermark: Mutex::new(Watermark::starting_at(at)),
            cancel: CancellationToken::new(),
        }
    }

    /// Whether the owning poller has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current watermark.
    #[must_use]
    pub fn watermark(&self) -> Watermark {
        *self.watermark.lock()
    }

    /// Check a response bracket against the watermark and, when accepted,
    /// advance it and run `deliver` before any other response of this
    /// bucket can be applied.
    pub fn admit_then<R>(
        &self,
        request_start: DateTime<Utc>,
        request_finish: DateTime<Utc>,
        deliver: impl FnOnce() -> R,
    ) -> Admission<R> {
        let mut watermark = self.watermark.lock();
        if self.is_stopped() {
            return Admission::Stopped;
        }
        if !watermark.advance(request_start, request_finish) {
            return Admission::Stale;
        }
        Admission::Delivered(deliver())
    }

    /// Run `f` serialized with deliveries, leaving the watermark unchanged.
    ///
    /// Returns `None` when the poller has been stopped.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _watermark = self.watermark.lock();
        if self.is_stopped() {
            return None;
        }
        Some(f())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Recurring timer for one bucket. Stops when dropped.
#[derive(Debug)]
pub struct Poller {
    state: Arc<PollerState>,
    task: JoinHandle<()>,
}

impl Poller {
    /// Start a poller firing `tick` every `period`, first after one period.
    pub fn spawn<F, Fut>(handle: &Handle, period: Duration, tick: F) -> Self
    where
        F: Fn(Arc<PollerState>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let state = Arc::new(PollerState::new(Utc::now()));
        let task = handle.spawn(run(Arc::clone(&state), period, tick));

        Self { state, task }
    }

    /// Shared state for in-flight ticks.
    #[must_use]
    pub const fn state(&self) -> &Arc<PollerState> {
        &self.state
    }

    /// Stop the timer. In-flight ticks finish but their responses are
    /// dropped.
    pub fn stop(&self) {
        self.state.stop();
    }

    /// Whether the timer task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.state.stop();
    }
}

async fn run<F, Fut>(state: Arc<PollerState>, period: Duration, tick: F)
where
    F: Fn(Arc<PollerState>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Some(start) = Instant::now().checked_add(period) else {
        tracing::error!(period_secs = period.as_secs_f64(), "Poll period out of range");
        return;
    };
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = state.cancel.cancelled() => {
                tracing::debug!(period_secs = period.as_secs_f64(), "Poller stopped");
                break;
            }
            _ = interval.tick() => {
                tokio::spawn(tick(Arc::clone(&state)));
            }
        }
    }
}
