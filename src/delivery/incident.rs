use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::analytics::IncidentType;

/// A classified, rate-limit-approved detection awaiting delivery.
#[derive(Debug, Clone)]
pub struct Incident {
    pub camera_id: String,
    pub kind: IncidentType,
    pub confidence: f32,
    pub image: Vec<u8>,
    pub detected_at: DateTime<Utc>,
}

/// Body of `POST /incidents`.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentPayload {
    pub cctv_id: String,
    #[serde(rename = "type")]
    pub kind: IncidentType,
    pub image_base64: String,
    pub detected_at: String,
    pub confidence: f32,
}

impl From<&Incident> for IncidentPayload {
    fn from(incident: &Incident) -> Self {
        Self {
            cctv_id: incident.camera_id.clone(),
            kind: incident.kind,
            image_base64: base64::engine::general_purpose::STANDARD.encode(&incident.image),
            detected_at: incident
                .detected_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            confidence: incident.confidence,
        }
    }
}
