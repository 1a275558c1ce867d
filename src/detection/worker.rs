use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::analytics::{classify, Detector};
use crate::camera::{snapshot, CaptureError, Frame, FrameSource};
use crate::delivery::{Incident, Uploader};

use super::rate_limit::RateLimiter;

const IDLE_SLEEP: Duration = Duration::from_millis(100);
const READ_BACKOFF: Duration = Duration::from_secs(1);
const FAULT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct WorkerTiming {
    pub detection_interval: Duration,
    pub idle_sleep: Duration,
    pub read_backoff: Duration,
    pub fault_backoff: Duration,
}

impl WorkerTiming {
    pub fn with_interval(detection_interval: Duration) -> Self {
        Self {
            detection_interval,
            ..Self::default()
        }
    }
}

impl Default for WorkerTiming {
    fn default() -> Self {
        Self {
            detection_interval: Duration::from_secs(1),
            idle_sleep: IDLE_SLEEP,
            read_backoff: READ_BACKOFF,
            fault_backoff: FAULT_BACKOFF,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub quality: i32,
    pub dir: Option<PathBuf>,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            quality: 90,
            dir: None,
        }
    }
}

/// Collaborators shared by every worker.
pub struct WorkerContext {
    pub detector: Arc<dyn Detector>,
    pub limiter: Arc<RateLimiter>,
    pub uploader: Arc<Uploader>,
    pub timing: WorkerTiming,
    pub snapshots: SnapshotSettings,
    pub runtime: tokio::runtime::Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    Exhausted,
}

enum Step {
    Continue,
    Exhausted,
}

/// Capture/detect loop for one camera. Runs on a blocking thread until its
/// `running` flag is cleared; the flag is checked once per iteration, so a
/// stop can take up to one read, one inference and one full delivery
/// sequence to take effect.
pub struct DetectionWorker {
    camera_id: String,
    source: Box<dyn FrameSource>,
    context: Arc<WorkerContext>,
    running: Arc<AtomicBool>,
    last_evaluation: Option<Instant>,
}

impl DetectionWorker {
    pub fn new(
        camera_id: String,
        source: Box<dyn FrameSource>,
        context: Arc<WorkerContext>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            camera_id,
            source,
            context,
            running,
            last_evaluation: None,
        }
    }

    pub fn run(mut self) -> WorkerExit {
        tracing::info!(camera = %self.camera_id, "detection worker started");

        let exit = loop {
            if !self.running.load(Ordering::Acquire) {
                break WorkerExit::Stopped;
            }

            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Exhausted) => {
                    tracing::warn!(camera = %self.camera_id, "end of stream");
                    break WorkerExit::Exhausted;
                }
                Err(e) => {
                    tracing::error!(
                        camera = %self.camera_id,
                        error = %e,
                        "detection loop error"
                    );
                    thread::sleep(self.context.timing.fault_backoff);
                }
            }
        };

        let Self {
            camera_id, source, ..
        } = self;
        drop(source);
        tracing::info!(camera = %camera_id, ?exit, "detection worker stopped, capture released");

        exit
    }

    fn step(&mut self) -> Result<Step, CaptureError> {
        let frame = match self.source.read() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::warn!(camera = %self.camera_id, "cannot read frame");
                thread::sleep(self.context.timing.read_backoff);
                return Ok(Step::Continue);
            }
            Err(CaptureError::Exhausted) => return Ok(Step::Exhausted),
            Err(e) => return Err(e),
        };

        let due = self
            .last_evaluation
            .map_or(true, |at| at.elapsed() >= self.context.timing.detection_interval);

        if due {
            self.last_evaluation = Some(Instant::now());
            self.evaluate(&frame);
        }

        thread::sleep(self.context.timing.idle_sleep);
        Ok(Step::Continue)
    }

    fn evaluate(&self, frame: &Frame) {
        let limiter = &self.context.limiter;
        if !limiter.has_capacity(&self.camera_id) {
            tracing::trace!(camera = %self.camera_id, "rate limit reached, detection skipped");
            return;
        }

        let detector = &self.context.detector;
        let detections = match panic::catch_unwind(AssertUnwindSafe(|| detector.infer(frame))) {
            Ok(Ok(d)) => d,
            Ok(Err(e)) => {
                tracing::warn!(camera = %self.camera_id, error = %e, "object detection error");
                return;
            }
            Err(_) => {
                tracing::error!(camera = %self.camera_id, "object detection panicked");
                return;
            }
        };

        let mut image: Option<Vec<u8>> = None;

        for detection in detections {
            let Some(kind) = classify(&detection.label, detection.confidence) else {
                continue;
            };

            // Several candidates in one frame must not push the camera past its cap
            if !limiter.has_capacity(&self.camera_id) {
                tracing::debug!(camera = %self.camera_id, "rate limit reached mid-frame");
                break;
            }

            tracing::info!(
                camera = %self.camera_id,
                kind = %kind,
                label = %detection.label,
                confidence = format!("{:.2}", detection.confidence),
                "incident detected"
            );

            let detected_at = Utc::now();
            let image = image
                .get_or_insert_with(|| self.snapshot(frame, detected_at))
                .clone();

            let incident = Incident {
                camera_id: self.camera_id.clone(),
                kind,
                confidence: detection.confidence,
                image,
                detected_at,
            };

            // Only confirmed deliveries count against the cap
            if self
                .context
                .runtime
                .block_on(self.context.uploader.deliver(&incident))
            {
                limiter.record(&self.camera_id);
            }
        }
    }

    fn snapshot(&self, frame: &Frame, taken_at: DateTime<Utc>) -> Vec<u8> {
        let settings = &self.context.snapshots;

        let jpeg = match snapshot::encode_jpeg(frame, settings.quality) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(camera = %self.camera_id, error = %e, "failed to encode snapshot");
                return Vec::new();
            }
        };

        if let Some(dir) = &settings.dir {
            match snapshot::save(dir, &self.camera_id, taken_at, &jpeg) {
                Ok(path) => {
                    tracing::debug!(camera = %self.camera_id, path = %path.display(), "snapshot saved")
                }
                Err(e) => {
                    tracing::warn!(camera = %self.camera_id, error = %e, "failed to save snapshot")
                }
            }
        }

        jpeg
    }
}
