//! Payload encoders applied in front of byte-oriented senders.

mod json;
pub use json::{JsonLayer, JsonService};

#[cfg(feature = "cloud-events")]
mod cloud_events;
#[cfg(feature = "cloud-events")]
pub use cloud_events::{
    CloudEventsHeaders, CloudEventsMessage, JsonCloudEventsLayer, JsonCloudEventsService,
    ToCloudEventsHeaders,
};
