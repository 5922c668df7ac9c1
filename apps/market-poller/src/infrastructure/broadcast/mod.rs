//! Shared Subscriber Streams
//!
//! Per-id multicast streams built on tokio broadcast channels with explicit
//! reference counting.
//!
//! # Lifecycle
//!
//! A [`SharedStream`] is cold when created: nothing is registered with its
//! owner until the first [`Consumer`] attaches. The first attach hands the
//! owner a [`StreamLink`] (through [`StreamLifecycle::first_attached`]) so
//! it can start publishing. When the last consumer detaches the stream
//! closes for good and the owner is told to tear down
//! ([`StreamLifecycle::last_detached`]). A closed stream never reopens;
//! callers subscribe again to get a fresh one.
//!
//! Lifecycle callbacks run while the stream's own lock is held. Owners may
//! take their own locks inside the callbacks but must never attach to, or
//! detach from, the same stream while holding those locks.

use std::fmt;
use std::sync::{Arc, Weak};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::domain::streaming::Notification;

/// Sending half shared by a stream and its owner.
pub type NotificationSender<T> = broadcast::Sender<Notification<T>>;

// =============================================================================
// Owner Hooks
// =============================================================================

/// Callbacks from a [`SharedStream`] to the component publishing into it.
pub trait StreamLifecycle<T>: Send + Sync {
    /// The first consumer attached; publishing may start.
    fn first_attached(&self, link: StreamLink<T>);

    /// The last consumer detached; the stream is closed.
    fn last_detached(&self, key: &str, serial: u64);
}

/// Handle given to a stream's owner on first attach.
pub struct StreamLink<T> {
    key: String,
    serial: u64,
    sender: NotificationSender<T>,
    core: Weak<StreamCore<T>>,
}

impl<T> StreamLink<T> {
    /// Stream key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Generation of the stream.
    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    /// Observer publishing into the stream.
    #[must_use]
    pub fn observer(&self) -> Observer<T> {
        Observer {
            serial: self.serial,
            sender: self.sender.clone(),
        }
    }

    /// Close the stream from the owner side.
    ///
    /// Must not be called from inside a lifecycle callback.
    pub fn close(&self) {
        if let Some(core) = self.core.upgrade() {
            core.close();
        }
    }
}

impl<T> fmt::Debug for StreamLink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLink")
            .field("key", &self.key)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

/// Publishing end registered by an owner for one stream generation.
#[derive(Debug)]
pub struct Observer<T> {
    serial: u64,
    sender: NotificationSender<T>,
}

impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Self {
            serial: self.serial,
            sender: self.sender.clone(),
        }
    }
}

impl<T> Observer<T> {
    /// Generation of the stream this observer publishes into.
    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    /// Publish one notification. Returns `false` when no consumer is
    /// listening.
    pub fn notify(&self, notification: Notification<T>) -> bool {
        self.sender.send(notification).is_ok()
    }
}

// =============================================================================
// Shared Stream
// =============================================================================

struct StreamState<T> {
    sender: Option<NotificationSender<T>>,
    consumers: usize,
    closed: bool,
}

/// Internal state of a [`SharedStream`].
pub struct StreamCore<T> {
    key: String,
    serial: u64,
    capacity: usize,
    state: Mutex<StreamState<T>>,
    lifecycle: Arc<dyn StreamLifecycle<T>>,
}

impl<T> StreamCore<T> {
    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.sender = None;
    }
}

/// A cold, reference-counted multicast stream for one key.
pub struct SharedStream<T> {
    core: Arc<StreamCore<T>>,
}

impl<T> Clone for SharedStream<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for SharedStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStream")
            .field("key", &self.core.key)
            .field("serial", &self.core.serial)
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

impl<T: Clone + Send + 'static> SharedStream<T> {
    /// Create a cold stream.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        serial: u64,
        capacity: usize,
        lifecycle: Arc<dyn StreamLifecycle<T>>,
    ) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            core: Arc::new(StreamCore {
                key: key.into(),
                serial,
                capacity,
                state: Mutex::new(StreamState {
                    sender: Some(sender),
                    consumers: 0,
                    closed: false,
                }),
                lifecycle,
            }),
        }
    }

    /// Attach a new consumer.
    ///
    /// Attaching to a closed stream yields a consumer that is already at
    /// its end.
    #[must_use]
    pub fn attach(&self) -> Consumer<T> {
        let mut state = self.core.state.lock();
        let receiver = match (&state.sender, state.closed) {
            (Some(sender), false) => sender.subscribe(),
            _ => return Consumer::ended(&self.core.key),
        };

        state.consumers += 1;
        if state.consumers == 1 {
            if let Some(sender) = state.sender.clone() {
                self.core.lifecycle.first_attached(StreamLink {
                    key: self.core.key.clone(),
                    serial: self.core.serial,
                    sender,
                    core: Arc::downgrade(&self.core),
                });
            }
        }
        drop(state);

        Consumer {
            receiver: NotificationReceiver::new(&self.core.key, Some(receiver)),
            guard: Some(AttachGuard {
                core: Arc::clone(&self.core),
            }),
        }
    }
}

impl<T> SharedStream<T> {
    /// Key of the stream.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.core.key
    }

    /// Generation of the stream.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.core.serial
    }

    /// Buffer size of the underlying channel.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    /// Number of attached consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.core.state.lock().consumers
    }

    /// Whether the stream has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.state.lock().closed
    }

    /// Whether both handles refer to the same stream.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// End the stream. Consumers drain what was already sent and then see
    /// the end of the stream. The owner is not notified.
    pub fn close(&self) {
        self.core.close();
    }
}

// =============================================================================
// Consumers
// =============================================================================

/// Keeps one consumer attached to a stream. Detaches on drop.
pub struct AttachGuard<T> {
    core: Arc<StreamCore<T>>,
}

impl<T> Drop for AttachGuard<T> {
    fn drop(&mut self) {
        let mut state = self.core.state.lock();
        state.consumers = state.consumers.saturating_sub(1);
        if state.consumers == 0 && !state.closed {
            state.closed = true;
            state.sender = None;
            self.core
                .lifecycle
                .last_detached(&self.core.key, self.core.serial);
        }
    }
}

impl<T> fmt::Debug for AttachGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachGuard")
            .field("key", &self.core.key)
            .finish_non_exhaustive()
    }
}

/// Receiving half of a consumer.
pub struct NotificationReceiver<T> {
    key: String,
    rx: Option<broadcast::Receiver<Notification<T>>>,
    finished: bool,
}

impl<T: Clone> NotificationReceiver<T> {
    fn new(key: &str, rx: Option<broadcast::Receiver<Notification<T>>>) -> Self {
        Self {
            key: key.to_string(),
            finished: rx.is_none(),
            rx,
        }
    }

    /// Wait for the next notification. Returns `None` once the stream has
    /// ended, either after a terminal notification or because it closed.
    pub async fn recv(&mut self) -> Option<Notification<T>> {
        if self.finished {
            return None;
        }
        let rx = self.rx.as_mut()?;

        loop {
            match rx.recv().await {
                Ok(notification) => return Some(self.observe(notification)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(key = %self.key, skipped, "Consumer lagged, notifications dropped");
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Take a notification if one is ready.
    pub fn try_recv(&mut self) -> Option<Notification<T>> {
        if self.finished {
            return None;
        }
        let rx = self.rx.as_mut()?;

        loop {
            match rx.try_recv() {
                Ok(notification) => return Some(self.observe(notification)),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(key = %self.key, skipped, "Consumer lagged, notifications dropped");
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Whether the stream has ended for this consumer.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    fn observe(&mut self, notification: Notification<T>) -> Notification<T> {
        if notification.is_terminal() {
            self.finished = true;
        }
        notification
    }
}

/// One attached consumer of a [`SharedStream`].
pub struct Consumer<T> {
    receiver: NotificationReceiver<T>,
    guard: Option<AttachGuard<T>>,
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("key", &self.receiver.key)
            .field("finished", &self.receiver.finished)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Consumer<T> {
    fn ended(key: &str) -> Self {
        Self {
            receiver: NotificationReceiver::new(key, None),
            guard: None,
        }
    }

    /// Key of the stream.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.receiver.key
    }

    /// Wait for the next notification; `None` at end of stream.
    pub async fn recv(&mut self) -> Option<Notification<T>> {
        self.receiver.recv().await
    }

    /// Take a notification if one is ready.
    pub fn try_recv(&mut self) -> Option<Notification<T>> {
        self.receiver.try_recv()
    }

    /// Whether the stream has ended for this consumer.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.receiver.is_finished()
    }

    /// Expose the consumer as a [`Stream`]. Dropping the stream detaches.
    pub fn into_stream(self) -> impl Stream<Item = Notification<T>> + Send + 'static
    where
        T: Sync,
    {
        futures::stream::unfold(self, |mut consumer| async move {
            let notification = consumer.recv().await?;
            Some((notification, consumer))
        })
    }

    /// Split into the receiving half and the attachment.
    #[must_use]
    pub fn into_parts(self) -> (NotificationReceiver<T>, Option<AttachGuard<T>>) {
        (self.receiver, self.guard)
    }
}
