//! Multiplexer Lifecycle Integration Tests
//!
//! Tests bucket creation and teardown, interval migration, fan-out and
//! freshness ordering through the public API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use market_poller::{
    ApplicationError, BatchResponse, BatchSource, FaultLogger, ListenerError, Multiplexer,
    MultiplexerConfig, Notification, PollInterval, PolledItem, SubscriberId, TransportFault,
    TransportFaults,
};

#[derive(Debug, Clone, PartialEq)]
struct Quote {
    id: String,
    seq: usize,
    closed: bool,
}

impl PolledItem for Quote {
    fn subscriber_id(&self) -> &str {
        &self.id
    }

    fn is_terminal(&self) -> bool {
        self.closed
    }
}

fn quote(id: &str, seq: usize) -> Quote {
    Quote {
        id: id.to_string(),
        seq,
        closed: false,
    }
}

#[derive(Default)]
struct RecordingLogger {
    entries: Mutex<Vec<String>>,
}

impl FaultLogger for RecordingLogger {
    fn log(&self, fault: &TransportFault, context: &str) {
        self.entries.lock().push(format!("{context} | {fault}"));
    }
}

/// Numbers every fetch and answers with one quote per requested id.
fn counting_listener() -> Multiplexer<Quote> {
    let calls = AtomicUsize::new(0);
    Multiplexer::pluggable(
        move |ids: &[SubscriberId]| {
            let seq = calls.fetch_add(1, Ordering::SeqCst);
            ids.iter().map(|id| quote(id, seq)).collect()
        },
        Arc::new(RecordingLogger::default()),
        MultiplexerConfig::named("lifecycle"),
    )
    .unwrap()
}

/// Source answering each fetch with the next scripted response.
struct ScriptedSource {
    script: Mutex<VecDeque<Result<BatchResponse<Quote>, TransportFaults>>>,
}

impl ScriptedSource {
    fn new(script: Vec<Result<BatchResponse<Quote>, TransportFaults>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }
}

#[async_trait]
impl BatchSource<Quote> for ScriptedSource {
    async fn fetch(
        &self,
        _ids: &[SubscriberId],
        _interval: PollInterval,
    ) -> Result<BatchResponse<Quote>, TransportFaults> {
        self.script.lock().pop_front().unwrap_or_else(|| {
            let now = Utc::now();
            Ok(BatchResponse::ok(Vec::new(), now, now))
        })
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

fn bracketed(
    items: Vec<Quote>,
    start: DateTime<Utc>,
    finish: DateTime<Utc>,
) -> BatchResponse<Quote> {
    BatchResponse::ok(items, start, finish)
}

// =============================================================================
// Bucket Tests
// =============================================================================

#[tokio::test]
async fn test_same_interval_shares_one_bucket() {
    let listener = counting_listener();

    let a = listener.subscribe("A", 1.0).unwrap();
    let b = listener.subscribe("B", 1.0).unwrap();
    let again = listener.subscribe("A", 1.0).unwrap();

    assert!(a.ptr_eq(&again));
    assert_eq!(listener.poller_count(), 1);
    assert_eq!(
        listener.bucket_ids(PollInterval::new(1.0).unwrap()),
        vec!["A".to_string(), "B".to_string()]
    );
    drop(b);
}

#[tokio::test]
async fn test_distinct_intervals_run_distinct_pollers() {
    let listener = counting_listener();

    let _a = listener.subscribe("A", 1.0).unwrap();
    let _b = listener.subscribe("B", 2.5).unwrap();

    assert_eq!(listener.poller_count(), 2);
    assert_eq!(
        listener.bucket_intervals(),
        vec![PollInterval::new(1.0).unwrap(), PollInterval::new(2.5).unwrap()]
    );
}

#[tokio::test]
async fn test_short_interval_is_clamped() {
    let listener = counting_listener();

    let _fast = listener.subscribe("fast", 0.05).unwrap();

    assert_eq!(listener.bucket_intervals(), vec![PollInterval::min()]);
    assert_eq!(listener.interval_of("fast"), Some(PollInterval::min()));
}

#[tokio::test]
async fn test_last_detach_destroys_bucket() {
    let listener = counting_listener();
    let stream = listener.subscribe("A", 1.0).unwrap();

    let first = stream.attach();
    let second = stream.attach();
    drop(stream);
    drop(first);

    assert!(listener.has_observer("A"));
    assert_eq!(listener.poller_count(), 1);

    drop(second);

    assert!(!listener.has_observer("A"));
    assert_eq!(listener.interval_of("A"), None);
    assert_eq!(listener.poller_count(), 0);
    assert!(listener.bucket_intervals().is_empty());
}

#[tokio::test]
async fn test_resubscribe_after_release_creates_new_stream() {
    let listener = counting_listener();

    let first = listener.subscribe("A", 1.0).unwrap();
    drop(first.attach());
    let second = listener.subscribe("A", 2.0).unwrap();

    assert!(!first.ptr_eq(&second));
    assert_eq!(listener.interval_of("A"), Some(PollInterval::new(2.0).unwrap()));
}

// =============================================================================
// Migration Tests
// =============================================================================

#[tokio::test]
async fn test_update_poll_interval_moves_id_and_keeps_observer() {
    let listener = counting_listener();
    let mut consumer = listener.subscribe("A", 1.0).unwrap().attach();

    listener.update_poll_interval("A", 2.5).unwrap();

    assert_eq!(listener.bucket_intervals(), vec![PollInterval::new(2.5).unwrap()]);
    assert_eq!(listener.poller_count(), 1);

    listener.force(2.5).await.unwrap();

    match consumer.recv().await {
        Some(Notification::Next(item)) => assert_eq!(item.id, "A"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_update_poll_interval_keeps_shared_bucket_alive() {
    let listener = counting_listener();
    let _a = listener.subscribe("A", 1.0).unwrap().attach();
    let _b = listener.subscribe("B", 1.0).unwrap().attach();

    listener.update_poll_interval("A", 3.0).unwrap();

    assert_eq!(listener.poller_count(), 2);
    assert_eq!(
        listener.bucket_ids(PollInterval::new(1.0).unwrap()),
        vec!["B".to_string()]
    );
    assert_eq!(
        listener.bucket_ids(PollInterval::new(3.0).unwrap()),
        vec!["A".to_string()]
    );
}

#[tokio::test]
async fn test_update_poll_interval_for_unknown_id_is_noop() {
    let listener = counting_listener();

    listener.update_poll_interval("ghost", 2.0).unwrap();

    assert_eq!(listener.poller_count(), 0);
}

// =============================================================================
// Fan-out Tests
// =============================================================================

#[tokio::test]
async fn test_no_cross_delivery_between_ids() {
    let listener = counting_listener();
    let mut a = listener.subscribe("A", 1.0).unwrap().attach();
    let mut b = listener.subscribe("B", 1.0).unwrap().attach();

    listener.force(1.0).await.unwrap();

    assert!(matches!(a.try_recv(), Some(Notification::Next(Quote { ref id, .. })) if id == "A"));
    assert!(matches!(b.try_recv(), Some(Notification::Next(Quote { ref id, .. })) if id == "B"));
    assert_eq!(a.try_recv(), None);
    assert_eq!(b.try_recv(), None);
}

#[tokio::test]
async fn test_every_consumer_of_an_id_receives_each_item() {
    let listener = counting_listener();
    let stream = listener.subscribe("A", 1.0).unwrap();
    let mut first = stream.attach();
    let mut second = stream.attach();

    listener.force(1.0).await.unwrap();

    assert_eq!(first.try_recv(), Some(Notification::Next(quote("A", 0))));
    assert_eq!(second.try_recv(), Some(Notification::Next(quote("A", 0))));
}

#[tokio::test]
async fn test_terminal_item_completes_and_suppresses_later_items() {
    let now = Utc::now() + TimeDelta::hours(1);
    let closed = Quote {
        closed: true,
        ..quote("A", 1)
    };
    let source = ScriptedSource::new(vec![
        Ok(bracketed(vec![quote("A", 0), quote("B", 0)], now, now)),
        Ok(bracketed(
            vec![closed, quote("B", 1)],
            now + TimeDelta::seconds(1),
            now + TimeDelta::seconds(1),
        )),
        Ok(bracketed(
            vec![quote("A", 2), quote("B", 2)],
            now + TimeDelta::seconds(2),
            now + TimeDelta::seconds(2),
        )),
    ]);
    let listener = Multiplexer::<Quote>::new(
        source,
        Arc::new(RecordingLogger::default()),
        MultiplexerConfig::default(),
    )
    .unwrap();
    let mut a = listener.subscribe("A", 1.0).unwrap().attach();
    let mut b = listener.subscribe("B", 1.0).unwrap().attach();

    for _ in 0..3 {
        listener.force(1.0).await.unwrap();
    }

    assert_eq!(a.recv().await, Some(Notification::Next(quote("A", 0))));
    assert_eq!(a.recv().await, Some(Notification::Completed));
    assert_eq!(a.recv().await, None);
    assert_eq!(listener.interval_of("A"), None);

    assert_eq!(b.recv().await, Some(Notification::Next(quote("B", 0))));
    assert_eq!(b.recv().await, Some(Notification::Next(quote("B", 1))));
    assert_eq!(b.recv().await, Some(Notification::Next(quote("B", 2))));
}

#[tokio::test]
async fn test_application_error_fails_whole_bucket_only() {
    let now = Utc::now() + TimeDelta::hours(1);
    let source = ScriptedSource::new(vec![Ok(BatchResponse::rejected(
        ApplicationError::new("TOO_MUCH_DATA", "limit exceeded"),
        now,
        now,
    ))]);
    let listener = Multiplexer::<Quote>::new(
        source,
        Arc::new(RecordingLogger::default()),
        MultiplexerConfig::default(),
    )
    .unwrap();
    let mut a = listener.subscribe("A", 1.0).unwrap().attach();
    let mut other = listener.subscribe("Z", 5.0).unwrap().attach();

    listener.force(1.0).await.unwrap();

    assert_eq!(
        a.recv().await,
        Some(Notification::Failed(ListenerError::Application(
            ApplicationError::new("TOO_MUCH_DATA", "limit exceeded")
        )))
    );
    assert_eq!(a.recv().await, None);
    assert_eq!(other.try_recv(), None);
    assert_eq!(listener.interval_of("Z"), Some(PollInterval::new(5.0).unwrap()));
}

// =============================================================================
// Freshness Tests
// =============================================================================

/// Rejection needs both an earlier start and a later finish than the last
/// accepted response.
#[tokio::test]
async fn test_freshness_rule_uses_both_bounds() {
    let base = Utc::now() + TimeDelta::hours(1);
    let at = |secs: i64| base + TimeDelta::seconds(secs);
    let source = ScriptedSource::new(vec![
        Ok(bracketed(vec![quote("A", 0)], at(10), at(20))),
        Ok(bracketed(vec![quote("A", 1)], at(5), at(25))),
        Ok(bracketed(vec![quote("A", 2)], at(15), at(18))),
        Ok(bracketed(vec![quote("A", 3)], at(12), at(30))),
    ]);
    let listener = Multiplexer::<Quote>::new(
        source,
        Arc::new(RecordingLogger::default()),
        MultiplexerConfig::default(),
    )
    .unwrap();
    let mut a = listener.subscribe("A", 1.0).unwrap().attach();

    for _ in 0..4 {
        listener.force(1.0).await.unwrap();
    }

    // seq 1 started before and finished after (10, 20): rejected.
    // seq 3 started before 15 and finished after 18: rejected.
    assert_eq!(a.try_recv(), Some(Notification::Next(quote("A", 0))));
    assert_eq!(a.try_recv(), Some(Notification::Next(quote("A", 2))));
    assert_eq!(a.try_recv(), None);
}

/// A response that started later but finished earlier is admitted.
#[tokio::test]
async fn test_freshness_rule_admits_nested_bracket() {
    let base = Utc::now() + TimeDelta::hours(1);
    let at = |secs: i64| base + TimeDelta::seconds(secs);
    let source = ScriptedSource::new(vec![
        Ok(bracketed(vec![quote("A", 0)], at(10), at(20))),
        Ok(bracketed(vec![quote("A", 1)], at(12), at(14))),
    ]);
    let listener = Multiplexer::<Quote>::new(
        source,
        Arc::new(RecordingLogger::default()),
        MultiplexerConfig::default(),
    )
    .unwrap();
    let mut a = listener.subscribe("A", 1.0).unwrap().attach();

    listener.force(1.0).await.unwrap();
    listener.force(1.0).await.unwrap();

    assert_eq!(a.try_recv(), Some(Notification::Next(quote("A", 0))));
    assert_eq!(a.try_recv(), Some(Notification::Next(quote("A", 1))));
}

// =============================================================================
// Timer Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transport_fault_is_logged_and_next_tick_recovers() {
    let now = Utc::now() + TimeDelta::hours(1);
    let source = ScriptedSource::new(vec![
        Err(TransportFaults(vec![
            TransportFault::Connection {
                message: "reset".to_string(),
            },
            TransportFault::Timeout {
                message: "slow".to_string(),
            },
        ])),
        Ok(bracketed(vec![quote("A", 1)], now, now)),
    ]);
    let logger = Arc::new(RecordingLogger::default());
    let listener = Multiplexer::<Quote>::new(
        source,
        Arc::clone(&logger) as Arc<dyn FaultLogger>,
        MultiplexerConfig::default(),
    )
    .unwrap();
    let mut a = listener.subscribe("A", 1.0).unwrap().attach();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(a.try_recv(), None);
    assert_eq!(
        *logger.entries.lock(),
        vec![
            "interval: 1s params: scripted | connection failed: reset".to_string(),
            "interval: 1s params: scripted | request timed out: slow".to_string(),
        ]
    );

    let next = timeout(Duration::from_secs(5), a.recv()).await.unwrap();
    assert_eq!(next, Some(Notification::Next(quote("A", 1))));
}

#[tokio::test(start_paused = true)]
async fn test_cold_stream_delivers_once_attached() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let listener = Multiplexer::pluggable(
        move |ids: &[SubscriberId]| {
            counter.fetch_add(1, Ordering::SeqCst);
            ids.iter().map(|id| quote(id, 0)).collect::<Vec<_>>()
        },
        Arc::new(RecordingLogger::default()),
        MultiplexerConfig::default(),
    )
    .unwrap();

    let stream = listener.subscribe("A", 1.0).unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    // The id is polled from subscription on; nothing is observed yet.
    assert!(!listener.has_observer("A"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let mut consumer = stream.attach();
    let next = timeout(Duration::from_secs(5), consumer.recv()).await.unwrap();

    assert!(matches!(next, Some(Notification::Next(_))));
}

#[tokio::test]
async fn test_minimum_interval_ticks_in_real_time() {
    let listener = counting_listener();
    let consumer = listener.subscribe("A", 0.2).unwrap().attach();
    let mut stream = std::pin::pin!(consumer.into_stream());

    let received = timeout(Duration::from_secs(3), async {
        let mut seqs = Vec::new();
        while let Some(notification) = stream.next().await {
            if let Notification::Next(item) = notification {
                seqs.push(item.seq);
            }
            if seqs.len() == 3 {
                break;
            }
        }
        seqs
    })
    .await
    .unwrap();

    assert_eq!(received.len(), 3);
    assert!(received.windows(2).all(|pair| pair[0] < pair[1]));
}

// =============================================================================
// Callback Delivery Tests
// =============================================================================

#[tokio::test]
async fn test_subscribe_with_runs_callbacks_in_order() {
    let now = Utc::now() + TimeDelta::hours(1);
    let source = ScriptedSource::new(vec![
        Ok(bracketed(vec![quote("A", 0)], now, now)),
        Ok(bracketed(
            vec![Quote {
                closed: true,
                ..quote("A", 1)
            }],
            now + TimeDelta::seconds(1),
            now + TimeDelta::seconds(1),
        )),
    ]);
    let listener = Multiplexer::<Quote>::new(
        source,
        Arc::new(RecordingLogger::default()),
        MultiplexerConfig::default(),
    )
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let done = tx.clone();

    let handle = listener
        .subscribe_with(
            "A",
            1.0,
            move |item: Quote| {
                let _ = tx.send(format!("next {}", item.seq));
            },
            move || {
                let _ = done.send("completed".to_string());
            },
            |error| panic!("unexpected error {error}"),
        )
        .unwrap();

    listener.force(1.0).await.unwrap();
    listener.force(1.0).await.unwrap();

    assert_eq!(rx.recv().await.as_deref(), Some("next 0"));
    assert_eq!(rx.recv().await.as_deref(), Some("completed"));
    assert_eq!(rx.recv().await, None);
    assert!(timeout(Duration::from_secs(1), async {
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .is_ok());
}

#[tokio::test]
async fn test_cancel_handle_releases_subscription() {
    let listener = counting_listener();
    let handle = listener
        .subscribe_with("A", 1.0, |_: Quote| {}, || {}, |_| {})
        .unwrap();

    assert!(listener.has_observer("A"));
    assert_eq!(handle.key(), "A");

    handle.cancel();

    assert!(!listener.has_observer("A"));
    assert_eq!(listener.poller_count(), 0);
}

// =============================================================================
// Disposal Tests
// =============================================================================

#[tokio::test]
async fn test_dispose_ends_streams_and_stops_pollers() {
    let listener = counting_listener();
    let mut a = listener.subscribe("A", 1.0).unwrap().attach();
    let _b = listener.subscribe("B", 2.0).unwrap();

    listener.dispose();
    listener.dispose();

    assert_eq!(a.recv().await, None);
    assert_eq!(listener.stats().pollers, 0);
    assert!(listener.is_disposed());
}
