use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::incident::{Incident, IncidentPayload};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("incident api responded {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait IncidentSink: Send + Sync {
    async fn submit(&self, payload: &IncidentPayload) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// Best-effort delivery: an incident that exhausts its attempts is dropped.
pub struct Uploader {
    sink: Arc<dyn IncidentSink>,
    policy: RetryPolicy,
}

impl Uploader {
    pub fn new(sink: Arc<dyn IncidentSink>, policy: RetryPolicy) -> Self {
        Self { sink, policy }
    }

    pub async fn deliver(&self, incident: &Incident) -> bool {
        let payload = IncidentPayload::from(incident);
        let attempts = self.policy.attempts.max(1);

        for attempt in 1..=attempts {
            match self.sink.submit(&payload).await {
                Ok(()) => {
                    tracing::info!(
                        camera = %incident.camera_id,
                        kind = %incident.kind,
                        attempt,
                        "incident delivered"
                    );
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        camera = %incident.camera_id,
                        kind = %incident.kind,
                        attempt,
                        attempts,
                        error = %e,
                        "incident delivery failed"
                    );
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.policy.delay).await;
            }
        }

        tracing::error!(
            camera = %incident.camera_id,
            kind = %incident.kind,
            attempts,
            "incident dropped after exhausting retries"
        );
        false
    }
}
