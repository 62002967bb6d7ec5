//! Periodic background worker shared by the dispatcher and the janitor.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::Stream;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

/// A running background poller.
///
/// Every item produced by the poll function is forwarded in order; the
/// poller is a [`Stream`] of those items. Once the cancellation token fires
/// the in-flight poll finishes, its items are still delivered, and the
/// stream ends.
pub struct Poller<T> {
    receiver: mpsc::Receiver<T>,
    handle: JoinHandle<()>,
}

impl<T> Poller<T> {
    /// Wait for the background task to exit.
    ///
    /// Errors only if the poll function panicked.
    pub async fn join(self) -> Result<(), JoinError> {
        drop(self.receiver);
        self.handle.await
    }
}

impl<T> Stream for Poller<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_recv(cx)
    }
}

/// Builder for a [`Poller`].
pub struct PollerBuilder {
    interval: Duration,
    channel_size: usize,
}

impl PollerBuilder {
    pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

    /// Poll every `interval`, at least [`Self::MIN_INTERVAL`]. The first poll
    /// happens immediately.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Self::MIN_INTERVAL),
            channel_size: 100,
        }
    }

    /// Capacity of the channel between the poll task and the consumer.
    pub fn channel_size(mut self, size: usize) -> Self {
        self.channel_size = size.max(1);
        self
    }

    /// Spawn the poll task.
    ///
    /// A poll that takes longer than the interval delays the next one rather
    /// than triggering a burst of catch-up polls.
    pub fn start<T, F, Fut>(self, cancel: CancellationToken, mut poll_fn: F) -> Poller<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Vec<T>> + Send,
    {
        let (tx, receiver) = mpsc::channel(self.channel_size);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        for item in poll_fn().await {
                            if tx.send(item).await.is_err() {
                                // Receiver dropped, stop polling
                                return;
                            }
                        }
                    }
                }
            }
        });

        Poller { receiver, handle }
    }
}
