use std::{collections::VecDeque, sync::Arc, time::Duration};

use tokio::sync::Mutex;

use crate::{Envelope, transport::Sender};

/// In-memory sender for tests or local pipelines.
///
/// Published envelopes are appended to a shared queue. Clones share the same
/// queue and script, so a test can keep one handle while the dispatcher owns
/// another. Failures and latency can be scripted to exercise retry and
/// timeout paths without a broker.
pub struct InMemory<H, M> {
    state: Arc<Mutex<State<H, M>>>,
}

struct State<H, M> {
    published: Vec<Envelope<H, M>>,
    failures: VecDeque<String>,
    latency: Option<Duration>,
}

impl<H, M> InMemory<H, M> {
    /// Make the next `times` sends fail with `message`.
    pub async fn fail_next(&self, times: usize, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.state.lock().await;
        state
            .failures
            .extend(std::iter::repeat_n(message, times));
    }

    /// Delay every send by `latency` before it completes.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Envelopes accepted so far, oldest first.
    pub async fn published(&self) -> Vec<Envelope<H, M>>
    where
        H: Clone,
        M: Clone,
    {
        self.state.lock().await.published.clone()
    }

    /// Drain the accepted envelopes.
    pub async fn take_published(&self) -> Vec<Envelope<H, M>> {
        std::mem::take(&mut self.state.lock().await.published)
    }
}

impl<H, M> Clone for InMemory<H, M> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<H, M> Default for InMemory<H, M> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                published: Vec::new(),
                failures: VecDeque::new(),
                latency: None,
            })),
        }
    }
}

#[async_trait::async_trait]
impl<H, M> Sender<H, M> for InMemory<H, M>
where
    H: std::fmt::Debug + Send,
    M: std::fmt::Debug + Send,
{
    type Error = std::io::Error;

    #[tracing::instrument(skip_all)]
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error> {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        if let Some(message) = state.failures.pop_front() {
            tracing::debug!(headers = ?envelope.headers, "Scripted in-memory send failure");
            return Err(std::io::Error::other(message));
        }

        tracing::info!(
            headers = ?envelope.headers,
            msg = ?envelope.message,
            "Message sent to in-memory queue",
        );
        state.published.push(envelope);
        Ok(())
    }
}
