//! Derived Streams
//!
//! A derived stream republishes one component of every item of a parent
//! stream. It shares the parent's subscription: attaching to it attaches to
//! the parent, and its last detach releases the parent again. No bucket or
//! poller is involved.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::multiplexer::MultiplexerError;
use crate::domain::market::{MarketBook, Runner};
use crate::domain::streaming::{ListenerError, Notification, PolledItem};
use crate::infrastructure::broadcast::{AttachGuard, SharedStream, StreamLifecycle, StreamLink};

/// One runner of a market book, with the book it was taken from.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerUpdate {
    /// The selected runner.
    pub runner: Runner,
    /// The book the runner belongs to.
    pub book: Arc<MarketBook>,
}

/// Stream of the component `key` of every item on `parent`.
///
/// For each parent item `extract` must return the component; when it
/// returns `None` the derived stream fails with
/// [`ListenerError::MissingComponent`]. Completion and failure of the parent
/// are passed through.
///
/// # Errors
///
/// Returns [`MultiplexerError::NoRuntime`] outside a runtime.
pub fn derive_stream<T, U, F>(
    parent: &SharedStream<T>,
    key: impl Into<String>,
    extract: F,
) -> Result<SharedStream<U>, MultiplexerError>
where
    T: PolledItem,
    U: Clone + Send + Sync + 'static,
    F: Fn(&T) -> Option<U> + Send + Sync + 'static,
{
    let runtime = Handle::try_current().map_err(|_| MultiplexerError::NoRuntime)?;
    let key = key.into();

    let lifecycle = Arc::new(Forwarder {
        parent: parent.clone(),
        component: key.clone(),
        extract: Arc::new(extract),
        runtime,
        task: Mutex::new(None),
        parent_guard: Arc::new(Mutex::new(None)),
    });

    Ok(SharedStream::new(
        format!("{}/{key}", parent.key()),
        parent.serial(),
        parent.capacity(),
        lifecycle,
    ))
}

/// Stream of one runner, by selection id, of a market book stream.
///
/// # Errors
///
/// Returns [`MultiplexerError::NoRuntime`] outside a runtime.
pub fn runner_stream(
    parent: &SharedStream<MarketBook>,
    selection_id: i64,
) -> Result<SharedStream<RunnerUpdate>, MultiplexerError> {
    derive_stream(parent, selection_id.to_string(), move |book: &MarketBook| {
        book.runner(selection_id).map(|runner| RunnerUpdate {
            runner: runner.clone(),
            book: Arc::new(book.clone()),
        })
    })
}

type ParentGuard<T> = Arc<Mutex<Option<AttachGuard<T>>>>;

struct Forwarder<T, F> {
    parent: SharedStream<T>,
    component: String,
    extract: Arc<F>,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
    parent_guard: ParentGuard<T>,
}

impl<T, U, F> StreamLifecycle<U> for Forwarder<T, F>
where
    T: PolledItem,
    U: Clone + Send + Sync + 'static,
    F: Fn(&T) -> Option<U> + Send + Sync + 'static,
{
    fn first_attached(&self, link: StreamLink<U>) {
        let (mut receiver, guard) = self.parent.attach().into_parts();
        *self.parent_guard.lock() = guard;

        let extract = Arc::clone(&self.extract);
        let component = self.component.clone();
        let parent_guard = Arc::clone(&self.parent_guard);
        let observer = link.observer();

        let task = self.runtime.spawn(async move {
            while let Some(notification) = receiver.recv().await {
                let forwarded = match notification {
                    Notification::Next(item) => match (*extract)(&item) {
                        Some(value) => Notification::Next(value),
                        None => Notification::Failed(ListenerError::MissingComponent {
                            parent: item.subscriber_id().to_string(),
                            key: component.clone(),
                        }),
                    },
                    Notification::Completed => Notification::Completed,
                    Notification::Failed(error) => Notification::Failed(error),
                };

                let terminal = forwarded.is_terminal();
                observer.notify(forwarded);
                if terminal {
                    break;
                }
            }

            let guard = parent_guard.lock().take();
            drop(guard);
            link.close();
        });

        *self.task.lock() = Some(task);
    }

    fn last_detached(&self, _key: &str, _serial: u64) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        let guard = self.parent_guard.lock().take();
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{FaultLogger, MockFaultLogger};
    use crate::application::services::{Multiplexer, MultiplexerConfig};
    use crate::domain::market::{MarketStatus, RunnerStatus};
    use crate::domain::subscription::SubscriberId;

    fn runner(selection_id: i64) -> Runner {
        Runner {
            selection_id,
            handicap: 0.0,
            status: RunnerStatus::Active,
            last_price_traded: None,
            total_matched: None,
        }
    }

    fn book(id: &str, status: MarketStatus, runners: &[i64]) -> MarketBook {
        MarketBook {
            market_id: id.to_string(),
            status,
            inplay: false,
            version: 1,
            total_matched: None,
            last_match_time: None,
            runners: runners.iter().copied().map(runner).collect(),
        }
    }

    fn logger() -> Arc<dyn FaultLogger> {
        let mut logger = MockFaultLogger::new();
        logger.expect_log().return_const(());
        Arc::new(logger)
    }

    fn listener(
        books: impl Fn(&str) -> MarketBook + Send + Sync + 'static,
    ) -> Multiplexer<MarketBook> {
        Multiplexer::pluggable(
            move |ids: &[SubscriberId]| ids.iter().map(|id| books(id.as_str())).collect(),
            logger(),
            MultiplexerConfig::named("derived"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn runner_stream_extracts_runner_with_book() {
        let listener = listener(|id| book(id, MarketStatus::Open, &[7, 9]));
        let parent = listener.subscribe("1.1", 30.0).unwrap();
        let mut consumer = runner_stream(&parent, 9).unwrap().attach();

        assert!(listener.has_observer("1.1"));
        listener.force(30.0).await.unwrap();

        match consumer.recv().await {
            Some(Notification::Next(update)) => {
                assert_eq!(update.runner.selection_id, 9);
                assert_eq!(update.book.market_id, "1.1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_runner_fails_stream() {
        let listener = listener(|id| book(id, MarketStatus::Open, &[7]));
        let parent = listener.subscribe("1.2", 30.0).unwrap();
        let mut consumer = runner_stream(&parent, 42).unwrap().attach();

        listener.force(30.0).await.unwrap();

        assert_eq!(
            consumer.recv().await,
            Some(Notification::Failed(ListenerError::MissingComponent {
                parent: "1.2".to_string(),
                key: "42".to_string(),
            }))
        );
        assert_eq!(consumer.recv().await, None);
    }

    #[tokio::test]
    async fn parent_completion_passes_through() {
        let listener = listener(|id| book(id, MarketStatus::Closed, &[7]));
        let parent = listener.subscribe("1.3", 30.0).unwrap();
        let mut consumer = runner_stream(&parent, 7).unwrap().attach();

        listener.force(30.0).await.unwrap();

        assert_eq!(consumer.recv().await, Some(Notification::Completed));
    }

    #[tokio::test]
    async fn last_detach_releases_parent_subscription() {
        let listener = listener(|id| book(id, MarketStatus::Open, &[7]));
        let parent = listener.subscribe("1.4", 30.0).unwrap();
        let derived = runner_stream(&parent, 7).unwrap();
        drop(parent);

        let consumer = derived.attach();
        assert!(listener.has_observer("1.4"));

        drop(consumer);

        assert!(!listener.has_observer("1.4"));
        assert_eq!(listener.interval_of("1.4"), None);
        assert_eq!(listener.poller_count(), 0);
    }
}
