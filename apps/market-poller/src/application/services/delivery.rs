//! Callback delivery.

use std::fmt;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::streaming::{ListenerError, Notification};
use crate::infrastructure::broadcast::Consumer;

/// One callback consumer of a shared stream, running on its own task.
///
/// Cancelling or dropping the handle detaches the consumer immediately;
/// callbacks that have not started yet are not invoked.
pub struct SubscriptionHandle {
    id: Uuid,
    key: String,
    task: JoinHandle<()>,
    guard: Option<Box<dyn Send + Sync>>,
}

impl SubscriptionHandle {
    /// Start delivering `consumer`'s notifications to the callbacks.
    ///
    /// `on_next` runs for every item. At most one of `on_completed` and
    /// `on_error` runs, after which the task ends. A stream that closes
    /// without a terminal notification ends the task silently.
    pub fn spawn<T, N, C, E>(
        runtime: &Handle,
        consumer: Consumer<T>,
        mut on_next: N,
        on_completed: C,
        on_error: E,
    ) -> Self
    where
        T: Clone + Send + 'static,
        N: FnMut(T) + Send + 'static,
        C: FnOnce() + Send + 'static,
        E: FnOnce(ListenerError) + Send + 'static,
    {
        let key = consumer.key().to_string();
        let (mut receiver, guard) = consumer.into_parts();

        let task = runtime.spawn(async move {
            while let Some(notification) = receiver.recv().await {
                match notification {
                    Notification::Next(item) => on_next(item),
                    Notification::Completed => {
                        on_completed();
                        return;
                    }
                    Notification::Failed(error) => {
                        on_error(error);
                        return;
                    }
                }
            }
        });

        Self {
            id: Uuid::new_v4(),
            key,
            task,
            guard: guard.map(|guard| Box::new(guard) as Box<dyn Send + Sync>),
        }
    }

    /// Unique id of this consumer.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Key of the stream being consumed.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether delivery has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Detach from the stream.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
        self.guard.take();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}
