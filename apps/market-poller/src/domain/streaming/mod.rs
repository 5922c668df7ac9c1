//! Subscriber Notifications
//!
//! Values delivered on every per-id stream. A stream yields any number of
//! [`Notification::Next`] values followed by at most one terminal value:
//! [`Notification::Completed`] when the entity reached its end of life, or
//! [`Notification::Failed`] when the subscription died and the consumer must
//! resubscribe.

/// Error reported by the remote API inside an otherwise well-formed
/// response (a server-side rejection).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApplicationError {
    /// Error code returned by the API.
    pub code: String,
    /// Human readable detail.
    pub message: String,
}

impl ApplicationError {
    /// Create a new application error.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Reason a stream ended with [`Notification::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenerError {
    /// The upstream API rejected the request for this id's bucket.
    #[error("upstream rejected request: {0}")]
    Application(#[from] ApplicationError),

    /// A derived stream found no component matching its key.
    #[error("no component {key} in item {parent}")]
    MissingComponent {
        /// Id of the parent item.
        parent: String,
        /// Key that was looked up.
        key: String,
    },
}

/// One value on a subscriber stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<T> {
    /// Fresh data for the subscribed entity.
    Next(T),
    /// The entity reached a terminal state; no more data will follow.
    Completed,
    /// The subscription failed; no more data will follow.
    Failed(ListenerError),
}

impl<T> Notification<T> {
    /// Whether this value ends the stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    /// The carried item, if any.
    #[must_use]
    pub fn into_item(self) -> Option<T> {
        match self {
            Self::Next(item) => Some(item),
            Self::Completed | Self::Failed(_) => None,
        }
    }

    /// Transform the carried item, keeping terminal values.
    #[must_use]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Notification<U> {
        match self {
            Self::Next(item) => Notification::Next(f(item)),
            Self::Completed => Notification::Completed,
            Self::Failed(error) => Notification::Failed(error),
        }
    }
}

/// An item the multiplexer can route and finish.
///
/// `subscriber_id` selects the observer an item is delivered to, and
/// `is_terminal` decides between normal delivery and completion.
pub trait PolledItem: Clone + Send + Sync + 'static {
    /// Id of the subscriber this item belongs to.
    fn subscriber_id(&self) -> &str;

    /// Whether the entity has reached its end of life.
    fn is_terminal(&self) -> bool {
        false
    }
}
