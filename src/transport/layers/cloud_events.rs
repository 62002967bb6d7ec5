use std::pin::Pin;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tower::{Layer, Service};

use crate::{
    Envelope, EventHeaders,
    transport::{RawPayload, TransportError},
};

/// Wraps every payload in a structured-mode CloudEvents 1.0 JSON document.
///
/// Headers pass through so byte-oriented senders can still route on them.
#[derive(Clone)]
pub struct JsonCloudEventsService<T> {
    inner: T,
    source: String,
}

impl<T, H, M> Service<Envelope<H, M>> for JsonCloudEventsService<T>
where
    H: ToCloudEventsHeaders + Send + 'static,
    M: Serialize + Send + 'static,
    T: Service<Envelope<H, RawPayload>> + Clone + Send + 'static,
    T::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Envelope<H, M>) -> Self::Future {
        let source = self.source.clone();
        let mut inner = self.inner.clone();
        std::mem::swap(&mut inner, &mut self.inner);

        Box::pin(async move {
            let bytes = CloudEventsMessage::new(source, &req.headers, &req.message)
                .and_then(|message| serde_json::to_vec(&message))
                .map_err(|e| TransportError::serde(Box::new(e)))?;
            let envelope = Envelope {
                headers: req.headers,
                message: RawPayload(bytes),
            };

            inner.call(envelope).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies [`JsonCloudEventsService`].
#[derive(Debug, Clone)]
pub struct JsonCloudEventsLayer {
    source: String,
}

impl JsonCloudEventsLayer {
    /// `source` becomes the CloudEvents `source` attribute, e.g. `/identity-service`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl<S> Layer<S> for JsonCloudEventsLayer {
    type Service = JsonCloudEventsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonCloudEventsService {
            source: self.source.clone(),
            inner: service,
        }
    }
}

/// Headers that can be projected onto CloudEvents context attributes.
pub trait ToCloudEventsHeaders {
    fn to_cloud_events_headers(&self) -> CloudEventsHeaders;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudEventsHeaders {
    pub subject: String,
    pub id: String,
    pub r#type: String,
    pub time: DateTime<Utc>,
}

impl ToCloudEventsHeaders for CloudEventsHeaders {
    fn to_cloud_events_headers(&self) -> CloudEventsHeaders {
        self.clone()
    }
}

impl ToCloudEventsHeaders for EventHeaders {
    fn to_cloud_events_headers(&self) -> CloudEventsHeaders {
        CloudEventsHeaders {
            subject: self.aggregate_id.clone(),
            id: self.id.to_string(),
            r#type: self.event_type.clone(),
            time: self.created_at,
        }
    }
}

/// Serialized form sent as the [`RawPayload`].
#[derive(Clone, Debug, Serialize)]
pub struct CloudEventsMessage {
    pub specversion: &'static str,
    pub source: String,
    pub subject: String,
    pub id: String,
    pub r#type: String,
    pub datacontenttype: &'static str,
    pub data: serde_json::Value,
    pub time: String,
}

impl CloudEventsMessage {
    pub const SPEC_VERSION: &'static str = "1.0";

    fn new<H, M>(source: String, headers: &H, data: &M) -> Result<Self, serde_json::Error>
    where
        H: ToCloudEventsHeaders,
        M: Serialize,
    {
        let headers = headers.to_cloud_events_headers();
        Ok(Self {
            specversion: Self::SPEC_VERSION,
            source,
            subject: headers.subject,
            id: headers.id,
            r#type: headers.r#type,
            datacontenttype: "application/json",
            data: serde_json::to_value(data)?,
            time: headers.time.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}
