use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use serde::Serialize;

use crate::analytics::{Detector, IncidentType};
use crate::camera::{Camera, CameraRegistry, CaptureBackend};
use crate::config::Config;
use crate::delivery::{Incident, Uploader};

use super::rate_limit::{CounterSnapshot, RateLimiter};
use super::rotation::{RotationScheduler, RotationSettings};
use super::supervisor::{StartError, Supervisor};
use super::worker::{SnapshotSettings, WorkerContext, WorkerTiming};

/// 1x1 PNG sent with synthetic incidents.
const TEST_IMAGE_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub timing: WorkerTiming,
    pub snapshots: SnapshotSettings,
    pub max_per_minute: u32,
    pub rotation: RotationSettings,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timing: WorkerTiming::with_interval(config.detection.interval()),
            snapshots: SnapshotSettings {
                quality: config.detection.snapshot_quality,
                dir: config.detection.snapshot_dir.clone(),
            },
            max_per_minute: config.detection.max_per_minute,
            rotation: RotationSettings::from(&config.rotation),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionStatus {
    pub model_ready: bool,
    pub running_camera_ids: Vec<String>,
    pub rotation_active: bool,
    pub rotation_cameras: Vec<String>,
    pub total_active_cameras: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionStats {
    pub active_detections: usize,
    pub detection_counters: BTreeMap<String, CounterSnapshot>,
    pub auto_rotation_status: bool,
    pub current_rotation_cameras: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraView {
    #[serde(flatten)]
    pub camera: Camera,
    pub is_detection_running: bool,
}

/// The detection control surface: owns the worker supervisor and the
/// rotation scheduler and answers status queries. Refusals come back as
/// `false` and are logged; `try_start` exposes the reason for callers that
/// map it, such as the HTTP API.
pub struct DetectionService {
    supervisor: Arc<Supervisor>,
    rotation: Arc<RotationScheduler>,
}

impl DetectionService {
    pub fn new(
        registry: Arc<CameraRegistry>,
        capture: Arc<dyn CaptureBackend>,
        detector: Arc<dyn Detector>,
        uploader: Arc<Uploader>,
        settings: ServiceSettings,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let context = Arc::new(WorkerContext {
            detector,
            limiter: Arc::new(RateLimiter::new(settings.max_per_minute)),
            uploader,
            timing: settings.timing,
            snapshots: settings.snapshots,
            runtime,
        });

        let supervisor = Arc::new(Supervisor::new(registry, capture, context));
        let rotation = Arc::new(RotationScheduler::new(
            supervisor.clone(),
            settings.rotation,
        ));

        Self {
            supervisor,
            rotation,
        }
    }

    pub fn registry(&self) -> &Arc<CameraRegistry> {
        self.supervisor.registry()
    }

    /// Blocks while the capture source is opened.
    pub fn start(&self, camera_id: &str) -> bool {
        self.try_start(camera_id).is_ok()
    }

    /// Like `start`, but reports why a camera was not started.
    pub fn try_start(&self, camera_id: &str) -> Result<(), StartError> {
        self.supervisor.start(camera_id)
    }

    pub fn stop(&self, camera_id: &str) -> bool {
        self.supervisor.stop(camera_id)
    }

    pub fn start_rotation(&self) -> bool {
        self.rotation.start_rotation()
    }

    /// Blocks while rotated cameras are flagged to stop.
    pub fn stop_rotation(&self) -> bool {
        self.rotation.stop_rotation()
    }

    pub fn status(&self) -> DetectionStatus {
        DetectionStatus {
            model_ready: true,
            running_camera_ids: self.supervisor.running_ids(),
            rotation_active: self.rotation.is_active(),
            rotation_cameras: self.rotation.current_cameras(),
            total_active_cameras: self.registry().active_ids().len(),
        }
    }

    pub fn stats(&self) -> DetectionStats {
        DetectionStats {
            active_detections: self.supervisor.running_count(),
            detection_counters: self.supervisor.context().limiter.snapshot(),
            auto_rotation_status: self.rotation.is_active(),
            current_rotation_cameras: self.rotation.current_cameras(),
        }
    }

    pub fn cameras(&self) -> Vec<CameraView> {
        self.registry()
            .all()
            .into_iter()
            .map(|camera| CameraView {
                is_detection_running: self.supervisor.is_running(&camera.id),
                camera,
            })
            .collect()
    }

    /// Administrative toggle. Deactivating a camera also stops its worker.
    /// `false` for an unknown camera.
    pub fn set_camera_active(&self, camera_id: &str, active: bool) -> bool {
        if !self.registry().set_active(camera_id, active) {
            return false;
        }

        tracing::info!(camera = %camera_id, active, "camera status changed");
        if !active {
            self.supervisor.stop(camera_id);
        }
        true
    }

    /// Delivers a synthetic incident through the normal delivery path,
    /// bypassing detection and rate limiting.
    pub async fn send_test_incident(&self, camera_id: &str, kind: IncidentType) -> bool {
        let image = base64::engine::general_purpose::STANDARD
            .decode(TEST_IMAGE_BASE64)
            .unwrap_or_default();

        let incident = Incident {
            camera_id: camera_id.to_string(),
            kind,
            confidence: 1.0,
            image,
            detected_at: Utc::now(),
        };

        tracing::info!(camera = %camera_id, kind = %kind, "sending test incident");
        self.supervisor.context().uploader.deliver(&incident).await
    }

    /// Stops rotation and every worker, then waits up to `grace` for
    /// capture handles to be released.
    pub async fn shutdown(&self, grace: Duration) {
        let rotation = self.rotation.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || rotation.stop_rotation()).await {
            tracing::error!(error = %e, "failed to stop auto rotation");
        }
        self.supervisor.shutdown(grace).await;
    }
}
