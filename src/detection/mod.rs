mod rate_limit;
mod rotation;
mod service;
mod supervisor;
mod worker;

pub use rate_limit::RateLimiter;
pub use rotation::RotationSettings;
pub use service::{CameraView, DetectionService, DetectionStatus, ServiceSettings};
pub use supervisor::StartError;
pub use worker::{SnapshotSettings, WorkerContext, WorkerTiming};
