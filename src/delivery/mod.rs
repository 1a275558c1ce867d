mod http;
mod incident;
mod uploader;

pub use http::HttpIncidentSink;
pub use incident::{Incident, IncidentPayload};
pub use uploader::{DeliveryError, IncidentSink, RetryPolicy, Uploader};
