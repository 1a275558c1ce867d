use async_trait::async_trait;
use reqwest::header::ACCEPT;

use crate::config::IncidentApiConfig;

use super::incident::IncidentPayload;
use super::uploader::{DeliveryError, IncidentSink};

/// Posts incidents as JSON to the incident-management API.
pub struct HttpIncidentSink {
    client: reqwest::Client,
    url: String,
}

impl HttpIncidentSink {
    pub fn new(config: &IncidentApiConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(format!("streetwatch/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: config.url(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IncidentSink for HttpIncidentSink {
    async fn submit(&self, payload: &IncidentPayload) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .header(ACCEPT, "application/json")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
