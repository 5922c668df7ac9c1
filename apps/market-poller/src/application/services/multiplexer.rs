//! Multi-Period Subscription Multiplexer
//!
//! Groups subscriber ids by poll interval. Every interval in use (a bucket)
//! has one [`Poller`]; each tick issues one batch request for all ids of the
//! bucket and fans the returned items out to per-id streams.
//!
//! # Locking
//!
//! - A structural lock guards bucket membership, pollers and streams. Bucket
//!   creation, teardown and migration happen entirely inside it.
//! - Observers live in a concurrent map so dispatch never takes the
//!   structural lock and tolerates misses.
//! - Each bucket's watermark lock orders deliveries of overlapping ticks.
//!
//! Lock order is stream, then structural, then observer map. The watermark
//! lock is only ever followed by the observer map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use super::delivery::SubscriptionHandle;
use crate::application::ports::{
    BatchResponse, BatchSource, FaultLogger, MarketBookClient, TransportFaults,
};
use crate::domain::interval::{IntervalError, PollInterval};
use crate::domain::market::{BookProjection, MarketBook};
use crate::domain::streaming::{ApplicationError, ListenerError, Notification, PolledItem};
use crate::domain::subscription::{IntervalRegistry, SubscriberId};
use crate::infrastructure::broadcast::{Observer, SharedStream, StreamLifecycle, StreamLink};
use crate::infrastructure::metrics::{self, Outcome};
use crate::infrastructure::poller::{Admission, Poller, PollerState};
use crate::infrastructure::source::{LiveBatchSource, PluggableBatchSource};

// =============================================================================
// Configuration and Errors
// =============================================================================

/// Multiplexer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerConfig {
    /// Label used in logs and metrics.
    pub name: String,
    /// Per-id broadcast buffer.
    pub channel_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            name: "listener".to_string(),
            channel_capacity: 64,
        }
    }
}

impl MultiplexerConfig {
    /// Default settings with a custom label.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Errors raised by listener operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MultiplexerError {
    /// The requested interval is not usable.
    #[error(transparent)]
    InvalidInterval(#[from] IntervalError),

    /// The listener has been disposed.
    #[error("listener has been disposed")]
    Disposed,

    /// The listener was created outside a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Snapshot of a multiplexer's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MultiplexerStats {
    /// Active buckets.
    pub buckets: usize,
    /// Running pollers.
    pub pollers: usize,
    /// Ids with a live stream.
    pub streams: usize,
    /// Ids with at least one attached consumer.
    pub observers: usize,
}

// =============================================================================
// State
// =============================================================================

struct Structure<T> {
    registry: IntervalRegistry,
    pollers: HashMap<PollInterval, Poller>,
    streams: HashMap<SubscriberId, SharedStream<T>>,
    disposed: bool,
}

impl<T> Structure<T> {
    fn new() -> Self {
        Self {
            registry: IntervalRegistry::new(),
            pollers: HashMap::new(),
            streams: HashMap::new(),
            disposed: false,
        }
    }

    fn owns(&self, id: &str, serial: u64) -> bool {
        self.streams.get(id).is_some_and(|s| s.serial() == serial)
    }
}

struct Inner<T: PolledItem> {
    config: MultiplexerConfig,
    source: Arc<dyn BatchSource<T>>,
    fault_logger: Arc<dyn FaultLogger>,
    runtime: Handle,
    structure: Mutex<Structure<T>>,
    observers: DashMap<SubscriberId, Observer<T>>,
    next_serial: AtomicU64,
}

// =============================================================================
// Multiplexer
// =============================================================================

/// Polls a [`BatchSource`] on behalf of many subscribers, one batch per
/// interval per tick.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use market_poller::application::services::{Multiplexer, MultiplexerConfig};
/// use market_poller::domain::market::MarketBook;
/// use market_poller::domain::subscription::SubscriberId;
/// use market_poller::infrastructure::source::PluggableBatchSource;
/// use market_poller::infrastructure::telemetry::TracingFaultLogger;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = PluggableBatchSource::new(|_: &[SubscriberId]| Vec::<MarketBook>::new());
/// let listener = Multiplexer::<MarketBook>::new(
///     Arc::new(source),
///     Arc::new(TracingFaultLogger),
///     MultiplexerConfig::named("books"),
/// )?;
///
/// let stream = listener.subscribe("1.234", 1.0)?;
/// let mut consumer = stream.attach();
/// while let Some(notification) = consumer.recv().await {
///     println!("{notification:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Multiplexer<T: PolledItem> {
    inner: Arc<Inner<T>>,
}

/// Multiplexer over market books.
pub type MarketListener = Multiplexer<MarketBook>;

impl<T: PolledItem> Multiplexer<T> {
    /// Create a multiplexer bound to the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::NoRuntime`] outside a runtime.
    pub fn new(
        source: Arc<dyn BatchSource<T>>,
        fault_logger: Arc<dyn FaultLogger>,
        config: MultiplexerConfig,
    ) -> Result<Self, MultiplexerError> {
        let runtime = Handle::try_current().map_err(|_| MultiplexerError::NoRuntime)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                source,
                fault_logger,
                runtime,
                structure: Mutex::new(Structure::new()),
                observers: DashMap::new(),
                next_serial: AtomicU64::new(1),
            }),
        })
    }

    /// Multiplexer over a synchronous fetch function.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::NoRuntime`] outside a runtime.
    pub fn pluggable<F>(
        fetch: F,
        fault_logger: Arc<dyn FaultLogger>,
        config: MultiplexerConfig,
    ) -> Result<Self, MultiplexerError>
    where
        F: Fn(&[SubscriberId]) -> Vec<T> + Send + Sync + 'static,
    {
        Self::new(
            Arc::new(PluggableBatchSource::new(fetch)),
            fault_logger,
            config,
        )
    }

    /// Stream for `id`, polled every `interval_secs`.
    ///
    /// Idempotent per id: while a stream for `id` is live the same stream
    /// is returned and `interval_secs` is ignored. The id joins its bucket
    /// immediately; nothing is delivered until a consumer attaches.
    ///
    /// # Errors
    ///
    /// Returns an error for an unusable interval or a disposed multiplexer.
    pub fn subscribe(
        &self,
        id: &str,
        interval_secs: f64,
    ) -> Result<SharedStream<T>, MultiplexerError> {
        let interval = PollInterval::new(interval_secs)?;
        let mut structure = self.inner.structure.lock();
        if structure.disposed {
            return Err(MultiplexerError::Disposed);
        }
        if let Some(stream) = structure.streams.get(id) {
            return Ok(stream.clone());
        }

        if structure.registry.assign(id, interval).created_bucket() {
            self.inner.start_poller(&mut structure, interval);
        }

        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let lifecycle = Arc::new(BucketLifecycle {
            inner: Arc::downgrade(&self.inner),
        });
        let stream = SharedStream::new(id, serial, self.inner.config.channel_capacity, lifecycle);
        structure.streams.insert(id.to_string(), stream.clone());

        tracing::debug!(
            listener = %self.inner.config.name,
            id,
            %interval,
            "Subscribed"
        );
        self.inner.publish_gauges(&structure);
        Ok(stream)
    }

    /// Subscribe and deliver to callbacks on a dedicated task.
    ///
    /// # Errors
    ///
    /// Same as [`Multiplexer::subscribe`].
    pub fn subscribe_with<N, C, E>(
        &self,
        id: &str,
        interval_secs: f64,
        on_next: N,
        on_completed: C,
        on_error: E,
    ) -> Result<SubscriptionHandle, MultiplexerError>
    where
        N: FnMut(T) + Send + 'static,
        C: FnOnce() + Send + 'static,
        E: FnOnce(ListenerError) + Send + 'static,
    {
        let stream = self.subscribe(id, interval_secs)?;
        Ok(SubscriptionHandle::spawn(
            &self.inner.runtime,
            stream.attach(),
            on_next,
            on_completed,
            on_error,
        ))
    }

    /// End the stream for `id` and remove it from its bucket, whether or not
    /// consumers are attached. Returns `false` if `id` had no stream.
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.inner.teardown(id, None)
    }

    /// Move `id` to the bucket for `interval_secs`.
    ///
    /// Does nothing if `id` has no live stream or is already polled at that
    /// interval. The old bucket is destroyed if this empties it.
    ///
    /// # Errors
    ///
    /// Returns an error for an unusable interval or a disposed multiplexer.
    pub fn update_poll_interval(
        &self,
        id: &str,
        interval_secs: f64,
    ) -> Result<(), MultiplexerError> {
        let to = PollInterval::new(interval_secs)?;
        let mut structure = self.inner.structure.lock();
        if structure.disposed {
            return Err(MultiplexerError::Disposed);
        }
        if !structure.streams.contains_key(id) {
            return Ok(());
        }

        let Some(migration) = structure.registry.reassign(id, to) else {
            return Ok(());
        };
        if migration.from.emptied_bucket {
            structure.pollers.remove(&migration.from.interval);
        }
        if migration.created_bucket {
            self.inner.start_poller(&mut structure, to);
        }

        tracing::debug!(
            listener = %self.inner.config.name,
            id,
            from = %migration.from.interval,
            %to,
            "Moved subscription"
        );
        self.inner.publish_gauges(&structure);
        Ok(())
    }

    /// Run one fetch cycle for the bucket at `interval_secs` now, as if its
    /// timer had fired. Completes once the response has been applied.
    ///
    /// # Errors
    ///
    /// Returns an error for an unusable interval or a disposed multiplexer.
    pub async fn force(&self, interval_secs: f64) -> Result<(), MultiplexerError> {
        let interval = PollInterval::new(interval_secs)?;
        let disposed = self.inner.structure.lock().disposed;
        if disposed {
            return Err(MultiplexerError::Disposed);
        }

        self.inner.run_cycle(interval, None).await;
        Ok(())
    }

    /// Stop every poller and end every stream. Idempotent.
    pub fn dispose(&self) {
        let streams: Vec<SharedStream<T>> = {
            let mut structure = self.inner.structure.lock();
            if structure.disposed {
                return;
            }
            structure.disposed = true;
            structure.pollers.clear();
            structure.registry = IntervalRegistry::new();
            structure.streams.drain().map(|(_, stream)| stream).collect()
        };
        self.inner.observers.clear();

        for stream in &streams {
            stream.close();
        }

        tracing::debug!(
            listener = %self.inner.config.name,
            streams = streams.len(),
            "Disposed"
        );
        metrics::set_active_buckets(&self.inner.config.name, 0);
        metrics::set_active_subscriptions(&self.inner.config.name, 0);
    }

    /// Whether [`Multiplexer::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.structure.lock().disposed
    }

    /// Intervals with an active bucket.
    #[must_use]
    pub fn bucket_intervals(&self) -> Vec<PollInterval> {
        let mut intervals = self.inner.structure.lock().registry.intervals();
        intervals.sort_by(|a, b| a.as_secs_f64().total_cmp(&b.as_secs_f64()));
        intervals
    }

    /// Ids in the bucket at `interval`, sorted.
    #[must_use]
    pub fn bucket_ids(&self, interval: PollInterval) -> Vec<SubscriberId> {
        let mut ids = self.inner.structure.lock().registry.ids(interval);
        ids.sort();
        ids
    }

    /// Interval `id` is currently polled at.
    #[must_use]
    pub fn interval_of(&self, id: &str) -> Option<PollInterval> {
        self.inner.structure.lock().registry.interval_of(id)
    }

    /// Number of running pollers.
    #[must_use]
    pub fn poller_count(&self) -> usize {
        self.inner.structure.lock().pollers.len()
    }

    /// Whether `id` has an attached consumer.
    #[must_use]
    pub fn has_observer(&self, id: &str) -> bool {
        self.inner.observers.contains_key(id)
    }

    /// Snapshot of the multiplexer's state.
    #[must_use]
    pub fn stats(&self) -> MultiplexerStats {
        let structure = self.inner.structure.lock();
        MultiplexerStats {
            buckets: structure.registry.bucket_count(),
            pollers: structure.pollers.len(),
            streams: structure.streams.len(),
            observers: self.inner.observers.len(),
        }
    }
}

impl MarketListener {
    /// Market listener over a remote market book client.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::NoRuntime`] outside a runtime.
    pub fn live<C>(
        client: C,
        projection: BookProjection,
        fault_logger: Arc<dyn FaultLogger>,
        config: MultiplexerConfig,
    ) -> Result<Self, MultiplexerError>
    where
        C: MarketBookClient + 'static,
    {
        Self::new(
            Arc::new(LiveBatchSource::new(client, projection)),
            fault_logger,
            config,
        )
    }
}

impl<T: PolledItem> Drop for Multiplexer<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: PolledItem> std::fmt::Debug for Multiplexer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("name", &self.inner.config.name)
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Bucket Operations
// =============================================================================

impl<T: PolledItem> Inner<T> {
    fn start_poller(self: &Arc<Self>, structure: &mut Structure<T>, interval: PollInterval) {
        let weak = Arc::downgrade(self);
        let poller = Poller::spawn(&self.runtime, interval.period(), move |state| {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.run_cycle(interval, Some(state)).await;
                }
            }
        });
        structure.pollers.insert(interval, poller);
        tracing::debug!(listener = %self.config.name, %interval, "Bucket created");
    }

    fn publish_gauges(&self, structure: &Structure<T>) {
        metrics::set_active_buckets(&self.config.name, structure.registry.bucket_count());
        metrics::set_active_subscriptions(&self.config.name, structure.streams.len());
    }

    /// Remove `id`'s stream, observer and bucket membership, then close the
    /// stream. With `serial`, only that stream generation is removed.
    fn teardown(&self, id: &str, serial: Option<u64>) -> bool {
        let stream = {
            let mut structure = self.structure.lock();
            let Some(stream) = structure.streams.get(id) else {
                return false;
            };
            if serial.is_some_and(|serial| stream.serial() != serial) {
                return false;
            }
            let serial = stream.serial();
            let stream = structure.streams.remove(id);
            self.observers.remove_if(id, |_, observer| observer.serial() == serial);
            self.release(&mut structure, id);
            self.publish_gauges(&structure);
            stream
        };

        if let Some(stream) = stream {
            stream.close();
        }
        true
    }

    fn release(&self, structure: &mut Structure<T>, id: &str) {
        if let Some(release) = structure.registry.release(id)
            && release.emptied_bucket
        {
            structure.pollers.remove(&release.interval);
            tracing::debug!(
                listener = %self.config.name,
                interval = %release.interval,
                "Bucket destroyed"
            );
        }
    }

    // =========================================================================
    // Fetch and Dispatch
    // =========================================================================

    async fn run_cycle(&self, interval: PollInterval, ticking: Option<Arc<PollerState>>) {
        let (ids, state) = {
            let structure = self.structure.lock();
            let Some(poller) = structure.pollers.get(&interval) else {
                return;
            };
            // A late tick of a poller already replaced for this interval.
            if ticking
                .as_ref()
                .is_some_and(|state| !Arc::ptr_eq(state, poller.state()))
            {
                return;
            }
            (
                structure.registry.ids(interval),
                Arc::clone(poller.state()),
            )
        };
        if ids.is_empty() {
            return;
        }

        metrics::record_tick(&self.config.name, interval.as_secs_f64());
        let started = Instant::now();
        let result = self.source.fetch(&ids, interval).await;
        metrics::record_fetch_duration(&self.config.name, started.elapsed());

        match result {
            Err(faults) => self.log_faults(interval, &faults),
            Ok(response) => match response.error {
                Some(error) => self.fail_bucket(interval, &ids, &state, &error),
                None => self.apply(interval, &state, response),
            },
        }
    }

    fn log_faults(&self, interval: PollInterval, faults: &TransportFaults) {
        let context = format!(
            "interval: {interval} params: {}",
            self.source.describe()
        );
        for fault in faults.iter() {
            self.fault_logger.log(fault, &context);
        }
        metrics::record_outcome(&self.config.name, Outcome::Fault, faults.0.len() as u64);
    }

    fn fail_bucket(
        &self,
        interval: PollInterval,
        ids: &[SubscriberId],
        state: &PollerState,
        error: &ApplicationError,
    ) {
        tracing::warn!(
            listener = %self.config.name,
            %interval,
            %error,
            "Upstream rejected bucket request"
        );
        metrics::record_outcome(&self.config.name, Outcome::Rejected, 1);

        let failed = state
            .exclusive(|| {
                ids.iter()
                    .filter_map(|id| self.observers.remove(id.as_str()))
                    .map(|(id, observer)| {
                        observer.notify(Notification::Failed(error.clone().into()));
                        (id, observer.serial())
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        for (id, serial) in failed {
            self.teardown(&id, Some(serial));
        }
    }

    fn apply(&self, interval: PollInterval, state: &PollerState, response: BatchResponse<T>) {
        let BatchResponse {
            items,
            request_start,
            request_finish,
            ..
        } = response;

        match state.admit_then(request_start, request_finish, || self.dispatch(items)) {
            Admission::Delivered(completed) => {
                for (id, serial) in completed {
                    self.teardown(&id, Some(serial));
                }
            }
            Admission::Stale => {
                tracing::debug!(
                    listener = %self.config.name,
                    %interval,
                    %request_start,
                    %request_finish,
                    "Dropped stale response"
                );
                metrics::record_outcome(&self.config.name, Outcome::Stale, 1);
            }
            Admission::Stopped => {}
        }
    }

    /// Deliver each item to its id's observer. Returns the ids completed by
    /// a terminal item.
    fn dispatch(&self, items: Vec<T>) -> Vec<(SubscriberId, u64)> {
        let mut delivered = 0_u64;
        let mut completed = Vec::new();

        for item in items {
            if item.is_terminal() {
                if let Some((id, observer)) = self.observers.remove(item.subscriber_id()) {
                    observer.notify(Notification::Completed);
                    metrics::record_completed(&self.config.name);
                    completed.push((id, observer.serial()));
                }
                continue;
            }

            let observer = self
                .observers
                .get(item.subscriber_id())
                .map(|entry| entry.value().clone());
            if let Some(observer) = observer {
                observer.notify(Notification::Next(item));
                delivered += 1;
            }
        }

        metrics::record_delivered(&self.config.name, delivered);
        completed
    }
}

// =============================================================================
// Stream Lifecycle
// =============================================================================

struct BucketLifecycle<T: PolledItem> {
    inner: Weak<Inner<T>>,
}

impl<T: PolledItem> StreamLifecycle<T> for BucketLifecycle<T> {
    fn first_attached(&self, link: StreamLink<T>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let structure = inner.structure.lock();
        if structure.disposed || !structure.owns(link.key(), link.serial()) {
            return;
        }
        inner
            .observers
            .insert(link.key().to_string(), link.observer());
        tracing::debug!(listener = %inner.config.name, id = link.key(), "Observer registered");
    }

    fn last_detached(&self, key: &str, serial: u64) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut structure = inner.structure.lock();
        if !structure.owns(key, serial) {
            return;
        }
        structure.streams.remove(key);
        inner
            .observers
            .remove_if(key, |_, observer| observer.serial() == serial);
        inner.release(&mut structure, key);
        inner.publish_gauges(&structure);
        tracing::debug!(listener = %inner.config.name, id = key, "Last consumer detached");
    }
}
