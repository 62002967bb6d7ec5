//! Message bus publish capability.
//!
//! The dispatcher only needs one operation from the bus: publish an envelope
//! and report success or failure. [`Transport`] wraps any Tower `Service`
//! implementing that operation, so middleware (encoding, rate limiting,
//! tracing) can be layered on, and normalises every failure into a
//! [`TransportError`] whose [`message`](TransportError::message) ends up in
//! the record's `last_error`.
//!
//! - [`Sender`]: trait implemented by concrete bus clients
//! - [`SenderService`]: adapter from a [`Sender`] to a Tower service
//! - [`InMemory`]: scriptable sender for tests and local pipelines
//! - [`layers`]: payload encoders (JSON, CloudEvents)
//! - `kafka` (feature `kafka`): Kafka / Redpanda producer

mod inmemory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub mod layers;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tower::Service;
use tracing_error::SpanTrace;

use crate::Envelope;

pub use inmemory::InMemory;

#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender backend.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Wrap an existing Tower service.
    pub fn from_service(service: S) -> Self {
        Self { service }
    }

    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }

    /// Publish an [`Envelope`], waiting for the inner service to be ready first.
    pub async fn send<H, M>(&mut self, envelope: Envelope<H, M>) -> Result<(), TransportError>
    where
        S: Service<Envelope<H, M>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        use tower::ServiceExt as _;

        let service = self.service.clone();
        service
            .oneshot(envelope)
            .await
            .map_err(|e| TransportError::from_boxed(e.into()))?;
        Ok(())
    }
}

impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::from_boxed(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let fut = self.service.call(req);
        Box::pin(async move {
            fut.await.map_err(|e| TransportError::from_boxed(e.into()))?;
            Ok(())
        })
    }
}

/// A failed publish attempt.
///
/// [`message`](TransportError::message) is the one-line text persisted as the
/// record's `last_error`; `Display` adds the span trace for logs.
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

#[derive(Debug)]
pub enum TransportErrorKind {
    /// The bus client rejected the envelope or could not reach the broker.
    Sender(tower::BoxError),
    /// The payload could not be encoded by a layer.
    Serde(tower::BoxError),
    /// The bus did not acknowledge the envelope in time.
    Timeout(Duration),
}

impl TransportError {
    fn new(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn sender(err: tower::BoxError) -> Self {
        Self::new(TransportErrorKind::Sender(err))
    }

    pub fn serde(err: tower::BoxError) -> Self {
        Self::new(TransportErrorKind::Serde(err))
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(TransportErrorKind::Timeout(after))
    }

    /// Recover a `TransportError` raised by a layer, or treat `err` as a sender failure.
    pub fn from_boxed(err: tower::BoxError) -> Self {
        match err.downcast::<TransportError>() {
            Ok(err) => *err,
            Err(err) => Self::sender(err),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    pub fn message(&self) -> String {
        match &self.kind {
            TransportErrorKind::Sender(err) => err.to_string(),
            TransportErrorKind::Serde(err) => format!("encoding failed: {err}"),
            TransportErrorKind::Timeout(after) => format!("publish timed out after {after:?}"),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.message())?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) | TransportErrorKind::Serde(err) => Some(err.as_ref()),
            TransportErrorKind::Timeout(_) => None,
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

impl<H, M, D> Service<Envelope<H, M>> for SenderService<D>
where
    H: Send + 'static,
    M: Send + 'static,
    D: Sender<H, M> + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Envelope<H, M>) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// A message bus client able to publish one envelope.
///
/// An `Ok` return means the bus accepted the message. Any error is treated as
/// a failed attempt and retried later, so implementations must tolerate
/// publishing the same envelope more than once.
#[async_trait::async_trait]
pub trait Sender<H, M> {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error>;
}

/// Encoded payload bytes produced by the encoding layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload(Vec<u8>);

impl RawPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}
