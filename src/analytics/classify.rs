use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentType {
    Accident,
    Crowd,
    Fire,
    Flood,
    Traffic,
}

impl IncidentType {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentType::Accident => "accident",
            IncidentType::Crowd => "crowd",
            IncidentType::Fire => "fire",
            IncidentType::Flood => "flood",
            IncidentType::Traffic => "traffic",
        }
    }
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
enum Rule {
    Always(IncidentType),
    /// Category only when confidence is strictly above the threshold.
    Above(f32, IncidentType),
    /// Low confidence reads as traffic, very high confidence as a possible
    /// collision, the band in between is dropped.
    Vehicle,
}

const VEHICLE_TRAFFIC_BELOW: f32 = 0.8;
const VEHICLE_ACCIDENT_ABOVE: f32 = 0.9;
const PERSON_CROWD_ABOVE: f32 = 0.7;

const LABEL_RULES: &[(&str, Rule)] = &[
    ("accident", Rule::Always(IncidentType::Accident)),
    ("crash", Rule::Always(IncidentType::Accident)),
    ("collision", Rule::Always(IncidentType::Accident)),
    ("debris", Rule::Always(IncidentType::Accident)),
    ("fire", Rule::Always(IncidentType::Fire)),
    ("smoke", Rule::Always(IncidentType::Fire)),
    ("flood", Rule::Always(IncidentType::Flood)),
    ("crowd", Rule::Always(IncidentType::Crowd)),
    ("person", Rule::Above(PERSON_CROWD_ABOVE, IncidentType::Crowd)),
    ("car", Rule::Vehicle),
    ("truck", Rule::Vehicle),
    ("bus", Rule::Vehicle),
    ("motorcycle", Rule::Vehicle),
];

/// Maps a raw detection to an incident category. Labels are matched
/// case-insensitively; unknown labels yield `None`.
pub fn classify(label: &str, confidence: f32) -> Option<IncidentType> {
    let label = label.trim().to_ascii_lowercase();
    let (_, rule) = LABEL_RULES.iter().find(|(name, _)| *name == label)?;

    match *rule {
        Rule::Always(kind) => Some(kind),
        Rule::Above(threshold, kind) => (confidence > threshold).then_some(kind),
        Rule::Vehicle => {
            if confidence > VEHICLE_ACCIDENT_ABOVE {
                Some(IncidentType::Accident)
            } else if confidence < VEHICLE_TRAFFIC_BELOW {
                Some(IncidentType::Traffic)
            } else {
                None
            }
        }
    }
}
