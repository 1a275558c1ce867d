mod classify;
mod object;

pub use classify::{classify, IncidentType};
pub use object::{DetectError, Detection, Detector, OnnxDetector};
