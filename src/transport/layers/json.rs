use std::{future::Future, pin::Pin};

use serde::Serialize;
use tower::{Layer, Service};

use crate::{
    Envelope,
    transport::{RawPayload, TransportError},
};

/// Serializes the payload of every envelope to JSON bytes before handing it
/// to the inner service. Headers pass through untouched.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T, H, M> Service<Envelope<H, M>> for JsonService<T>
where
    H: Send + 'static,
    M: Serialize + Send + 'static,
    T: Service<Envelope<H, RawPayload>> + Clone + Send + 'static,
    T::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Envelope<H, M>) -> Self::Future {
        let bytes = serde_json::to_vec(&req.message);
        let mut inner = self.inner.clone();
        // The clone may not be ready; keep the service that was polled.
        std::mem::swap(&mut inner, &mut self.inner);

        Box::pin(async move {
            let bytes = bytes.map_err(|e| TransportError::serde(Box::new(e)))?;
            let envelope = Envelope {
                headers: req.headers,
                message: RawPayload(bytes),
            };
            inner.call(envelope).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies [`JsonService`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}
