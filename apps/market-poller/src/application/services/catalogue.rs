//! Catalogue Listener
//!
//! A single-bucket listener: one timer for the whole listener, one fetch
//! per registered filter on every tick, and one freshness watermark shared
//! by all filters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use super::multiplexer::{MultiplexerConfig, MultiplexerError};
use crate::application::ports::{CatalogueClient, FaultLogger};
use crate::domain::interval::PollInterval;
use crate::domain::market::{CatalogueFilter, FilterId, MarketCatalogue};
use crate::domain::streaming::{ApplicationError, Notification};
use crate::infrastructure::broadcast::{Observer, SharedStream, StreamLifecycle, StreamLink};
use crate::infrastructure::metrics::{self, Outcome};
use crate::infrastructure::poller::{Admission, Poller, PollerState};

/// Catalogues returned for one filter on one tick.
pub type CatalogueBatch = Vec<MarketCatalogue>;

struct Entry {
    filter: CatalogueFilter,
    stream: SharedStream<CatalogueBatch>,
}

#[derive(Default)]
struct Registry {
    entries: BTreeMap<FilterId, Entry>,
    disposed: bool,
}

impl Registry {
    fn owns(&self, id: &FilterId, serial: u64) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.stream.serial() == serial)
    }
}

struct Inner<C> {
    client: C,
    fault_logger: Arc<dyn FaultLogger>,
    config: MultiplexerConfig,
    period: PollInterval,
    registry: Mutex<Registry>,
    observers: DashMap<FilterId, Observer<CatalogueBatch>>,
    poller: Mutex<Option<Poller>>,
    next_serial: AtomicU64,
}

/// Polls market catalogues for a set of filters on one shared timer.
pub struct CatalogueListener<C: CatalogueClient + 'static> {
    inner: Arc<Inner<C>>,
}

impl<C: CatalogueClient + 'static> CatalogueListener<C> {
    /// Create a listener polling every `period_secs` and start its timer.
    ///
    /// # Errors
    ///
    /// Returns an error for an unusable period or outside a runtime.
    pub fn new(
        client: C,
        fault_logger: Arc<dyn FaultLogger>,
        period_secs: f64,
        config: MultiplexerConfig,
    ) -> Result<Self, MultiplexerError> {
        let period = PollInterval::new(period_secs)?;
        let runtime = Handle::try_current().map_err(|_| MultiplexerError::NoRuntime)?;

        let inner = Arc::new(Inner {
            client,
            fault_logger,
            config,
            period,
            registry: Mutex::new(Registry::default()),
            observers: DashMap::new(),
            poller: Mutex::new(None),
            next_serial: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        let poller = Poller::spawn(&runtime, period.period(), move |state| {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.run_cycle(&state).await;
                }
            }
        });
        *inner.poller.lock() = Some(poller);

        Ok(Self { inner })
    }

    /// Stream of catalogues for `filter`.
    ///
    /// Idempotent per filter id: while a stream for the id is live it is
    /// returned unchanged and the new filter definition is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::Disposed`] after disposal.
    pub fn subscribe_filter(
        &self,
        filter: CatalogueFilter,
    ) -> Result<SharedStream<CatalogueBatch>, MultiplexerError> {
        let mut registry = self.inner.registry.lock();
        if registry.disposed {
            return Err(MultiplexerError::Disposed);
        }
        if let Some(entry) = registry.entries.get(&filter.id) {
            return Ok(entry.stream.clone());
        }

        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let lifecycle = Arc::new(FilterLifecycle {
            inner: Arc::downgrade(&self.inner),
        });
        let stream = SharedStream::new(
            filter.id.as_str(),
            serial,
            self.inner.config.channel_capacity,
            lifecycle,
        );

        tracing::debug!(listener = %self.inner.config.name, filter = %filter.id, "Filter registered");
        registry.entries.insert(
            filter.id.clone(),
            Entry {
                filter,
                stream: stream.clone(),
            },
        );
        metrics::set_active_subscriptions(&self.inner.config.name, registry.entries.len());
        Ok(stream)
    }

    /// Remove the filter, its observer and its stream. Returns `false` if
    /// the filter was not registered.
    pub fn unsubscribe(&self, id: &FilterId) -> bool {
        self.inner.teardown(id, None)
    }

    /// Run one cycle now, as if the timer had fired.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::Disposed`] after disposal.
    pub async fn force(&self) -> Result<(), MultiplexerError> {
        let state = self
            .inner
            .poller
            .lock()
            .as_ref()
            .map(|poller| Arc::clone(poller.state()));
        let Some(state) = state else {
            return Err(MultiplexerError::Disposed);
        };

        self.inner.run_cycle(&state).await;
        Ok(())
    }

    /// Stop the timer and end every stream. Idempotent.
    pub fn dispose(&self) {
        let poller = self.inner.poller.lock().take();
        drop(poller);

        let streams: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            registry.disposed = true;
            std::mem::take(&mut registry.entries)
                .into_values()
                .map(|entry| entry.stream)
                .collect()
        };
        self.inner.observers.clear();

        for stream in streams {
            stream.close();
        }
        metrics::set_active_subscriptions(&self.inner.config.name, 0);
    }

    /// Registered filter ids.
    #[must_use]
    pub fn filter_ids(&self) -> Vec<FilterId> {
        self.inner.registry.lock().entries.keys().cloned().collect()
    }

    /// The registered definition of a filter.
    #[must_use]
    pub fn filter(&self, id: &FilterId) -> Option<CatalogueFilter> {
        self.inner
            .registry
            .lock()
            .entries
            .get(id)
            .map(|entry| entry.filter.clone())
    }

    /// Timer period.
    #[must_use]
    pub fn period(&self) -> PollInterval {
        self.inner.period
    }

    /// Whether the timer is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.poller.lock().is_some()
    }

    /// Whether `id` has an attached consumer.
    #[must_use]
    pub fn has_observer(&self, id: &FilterId) -> bool {
        self.inner.observers.contains_key(id)
    }
}

impl<C: CatalogueClient + 'static> Drop for CatalogueListener<C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<C: CatalogueClient + 'static> Inner<C> {
    fn teardown(&self, id: &FilterId, serial: Option<u64>) -> bool {
        let entry = {
            let mut registry = self.registry.lock();
            let Some(entry) = registry.entries.get(id) else {
                return false;
            };
            if serial.is_some_and(|serial| entry.stream.serial() != serial) {
                return false;
            }
            let serial = entry.stream.serial();
            self.observers
                .remove_if(id, |_, observer| observer.serial() == serial);
            let entry = registry.entries.remove(id);
            metrics::set_active_subscriptions(&self.config.name, registry.entries.len());
            entry
        };

        if let Some(entry) = entry {
            entry.stream.close();
        }
        true
    }

    async fn run_cycle(&self, state: &PollerState) {
        let filters: Vec<CatalogueFilter> = self
            .registry
            .lock()
            .entries
            .values()
            .map(|entry| entry.filter.clone())
            .collect();

        for filter in filters {
            metrics::record_tick(&self.config.name, self.period.as_secs_f64());
            let started = Instant::now();
            let result = self
                .client
                .list_market_catalogue(
                    &filter.market_filter(Utc::now()),
                    &filter.projection,
                    filter.sort,
                    filter.max_results,
                )
                .await;
            metrics::record_fetch_duration(&self.config.name, started.elapsed());

            let response = match result {
                Ok(response) => response,
                Err(faults) => {
                    let context = format!("interval: {} filter: {}", self.period, filter.id);
                    for fault in faults.iter() {
                        self.fault_logger.log(fault, &context);
                    }
                    metrics::record_outcome(
                        &self.config.name,
                        Outcome::Fault,
                        faults.0.len() as u64,
                    );
                    continue;
                }
            };

            if let Some(error) = response.error {
                self.fail_all(state, &error);
                return;
            }

            let admission = state.admit_then(response.request_start, response.request_finish, || {
                self.deliver(&filter.id, response.items)
            });
            match admission {
                Admission::Delivered(()) => {}
                Admission::Stale => {
                    tracing::debug!(
                        listener = %self.config.name,
                        filter = %filter.id,
                        "Dropped stale response"
                    );
                    metrics::record_outcome(&self.config.name, Outcome::Stale, 1);
                }
                Admission::Stopped => return,
            }
        }
    }

    fn deliver(&self, id: &FilterId, items: CatalogueBatch) {
        let observer = self.observers.get(id).map(|entry| entry.value().clone());
        if let Some(observer) = observer {
            observer.notify(Notification::Next(items));
            metrics::record_delivered(&self.config.name, 1);
        }
    }

    /// Fail every observed filter.
    fn fail_all(&self, state: &PollerState, error: &ApplicationError) {
        tracing::warn!(listener = %self.config.name, %error, "Upstream rejected catalogue request");
        metrics::record_outcome(&self.config.name, Outcome::Rejected, 1);

        let failed = state
            .exclusive(|| {
                let ids: Vec<FilterId> = self
                    .observers
                    .iter()
                    .map(|entry| entry.key().clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|id| self.observers.remove(&id))
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
}

struct FilterLifecycle<C> {
    inner: Weak<Inner<C>>,
}

impl<C: CatalogueClient + 'static> StreamLifecycle<CatalogueBatch> for FilterLifecycle<C> {
    fn first_attached(&self, link: StreamLink<CatalogueBatch>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let id = FilterId::new(link.key());
        let registry = inner.registry.lock();
        if registry.disposed || !registry.owns(&id, link.serial()) {
            return;
        }
        inner.observers.insert(id, link.observer());
    }

    fn last_detached(&self, key: &str, serial: u64) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let id = FilterId::new(key);
        let mut registry = inner.registry.lock();
        if !registry.owns(&id, serial) {
            return;
        }
        registry.entries.remove(&id);
        inner
            .observers
            .remove_if(&id, |_, observer| observer.serial() == serial);
        metrics::set_active_subscriptions(&inner.config.name, registry.entries.len());
        tracing::debug!(listener = %inner.config.name, filter = %id, "Filter released");
    }
}
