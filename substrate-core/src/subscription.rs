//! Long-lived polling subscriptions over a stream or the global log.
//!
//! A [`Subscription`] is a scoped, cancellable background task: it owns a
//! [`CancellationToken`] linked to the caller's, and dropping/shutting it
//! down cancels the token and awaits the loop's termination, swallowing the
//! `Cancelled` error the way the loop's own teardown path does.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SubscriptionError;
use crate::event::PersistedEnvelope;

/// Default batch size for one subscription poll, per the enumerated
/// configuration options.
pub const DEFAULT_SUBSCRIPTION_BATCH: usize = 100;

/// User callback invoked once per delivered event, in cursor order.
pub type OnEvent<T> =
    Arc<dyn Fn(PersistedEnvelope<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A running polling subscription. Holding this value keeps the background
/// task alive; dropping it (or calling [`Subscription::shutdown`]) cancels
/// the loop.
pub struct Subscription {
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<(), SubscriptionError>>>,
}

impl Subscription {
    pub(crate) fn new(
        cancel: CancellationToken,
        handle: JoinHandle<Result<(), SubscriptionError>>,
    ) -> Self {
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Cancels the subscription and awaits the loop's termination.
    ///
    /// The loop's own `Cancelled` signal is swallowed here, matching the
    /// "no error is silently swallowed except `Cancelled` inside a
    /// subscription's teardown path" rule: any other error the handler or
    /// the store raised is propagated.
    pub async fn shutdown(mut self) -> Result<(), SubscriptionError> {
        self.cancel.cancel();

        if let Some(handle) = self.handle.take() {
            return handle.await.unwrap_or(Ok(()));
        }

        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs the polling loop shared by `subscribe_stream` and `subscribe_all`.
///
/// `fetch_batch` returns up to [`DEFAULT_SUBSCRIPTION_BATCH`] envelopes after
/// `last_cursor`, in ascending cursor order; `cursor_of` extracts the cursor
/// (stream version, respectively global sequence) from a delivered envelope.
pub(crate) async fn run<T, F, Fut>(
    mut last_cursor: i64,
    polling_interval: std::time::Duration,
    on_event: OnEvent<T>,
    cursor_of: fn(&PersistedEnvelope<T>) -> i64,
    mut fetch_batch: F,
    cancel: CancellationToken,
) -> Result<(), SubscriptionError>
where
    F: FnMut(i64) -> Fut + Send,
    Fut: Future<Output = Result<Vec<PersistedEnvelope<T>>, crate::error::StoreError>> + Send,
    T: Send,
{
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let batch = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            result = fetch_batch(last_cursor) => result?,
        };

        if batch.is_empty() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(polling_interval) => {},
            }
            continue;
        }

        tracing::debug!(batch_len = batch.len(), last_cursor, "subscription poll delivered a batch");

        for envelope in batch {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let cursor = cursor_of(&envelope);
            if let Err(err) = on_event(envelope).await {
                tracing::warn!(cursor, error = %err, "subscription handler returned an error");
                return Err(SubscriptionError::Handler(err));
            }
            last_cursor = cursor;
        }
    }
}
