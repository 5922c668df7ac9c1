//! Function-backed source.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::Utc;

use crate::application::ports::{BatchResponse, BatchSource, TransportFaults};
use crate::domain::interval::PollInterval;
use crate::domain::subscription::SubscriberId;

/// Source backed by a synchronous function of the requested ids.
///
/// The request bracket is the wall-clock time around the call, so every
/// response of a bucket is accepted unless ticks overlap.
pub struct PluggableBatchSource<T, F> {
    fetch: F,
    _item: PhantomData<fn() -> T>,
}

impl<T, F> PluggableBatchSource<T, F>
where
    F: Fn(&[SubscriberId]) -> Vec<T> + Send + Sync,
{
    /// Wrap `fetch`.
    #[must_use]
    pub const fn new(fetch: F) -> Self {
        Self {
            fetch,
            _item: PhantomData,
        }
    }
}

impl<T, F> fmt::Debug for PluggableBatchSource<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluggableBatchSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, F> BatchSource<T> for PluggableBatchSource<T, F>
where
    T: Send + 'static,
    F: Fn(&[SubscriberId]) -> Vec<T> + Send + Sync,
{
    async fn fetch(
        &self,
        ids: &[SubscriberId],
        _interval: PollInterval,
    ) -> Result<BatchResponse<T>, TransportFaults> {
        let request_start = Utc::now();
        let items = (self.fetch)(ids);
        let request_finish = Utc::now();

        Ok(BatchResponse::ok(items, request_start, request_finish))
    }

    fn describe(&self) -> String {
        "pluggable".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calls_function_with_bucket_ids() {
        let source = PluggableBatchSource::new(|ids: &[SubscriberId]| {
            ids.iter().map(|id| format!("item-{id}")).collect::<Vec<_>>()
        });

        let response = source
            .fetch(&["a".to_string(), "b".to_string()], PollInterval::min())
            .await
            .unwrap();

        assert_eq!(response.items, vec!["item-a", "item-b"]);
        assert!(response.error.is_none());
        assert!(response.request_start <= response.request_finish);
    }
}
