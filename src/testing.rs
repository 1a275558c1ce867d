//! In-memory capture, detection and delivery fakes shared by unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::analytics::{DetectError, Detection, Detector};
use crate::camera::{
    Camera, CameraRegistry, CaptureBackend, CaptureError, Frame, FrameSource, Location, Priority,
};
use crate::delivery::{DeliveryError, IncidentPayload, IncidentSink, RetryPolicy, Uploader};
use crate::detection::{RateLimiter, SnapshotSettings, WorkerContext, WorkerTiming};

pub fn camera(id: &str, active: bool) -> Camera {
    Camera {
        id: id.to_string(),
        name: format!("Camera {id}"),
        source: format!("fake://{id}"),
        location: Location::default(),
        priority: Priority::High,
        active,
    }
}

pub fn registry(ids: &[&str]) -> Arc<CameraRegistry> {
    Arc::new(CameraRegistry::new(
        ids.iter().map(|id| camera(id, true)).collect(),
    ))
}

pub fn fast_timing() -> WorkerTiming {
    WorkerTiming {
        detection_interval: Duration::from_millis(10),
        idle_sleep: Duration::from_millis(2),
        read_backoff: Duration::from_millis(5),
        fault_backoff: Duration::from_millis(5),
    }
}

/// Worker context on the current runtime with a single delivery attempt.
pub fn context(
    detector: Arc<dyn Detector>,
    sink: Arc<dyn IncidentSink>,
    max_per_minute: u32,
) -> Arc<WorkerContext> {
    let uploader = Uploader::new(
        sink,
        RetryPolicy {
            attempts: 1,
            delay: Duration::from_millis(1),
        },
    );
    Arc::new(WorkerContext {
        detector,
        limiter: Arc::new(RateLimiter::new(max_per_minute)),
        uploader: Arc::new(uploader),
        timing: fast_timing(),
        snapshots: SnapshotSettings::default(),
        runtime: tokio::runtime::Handle::current(),
    })
}

pub fn frame() -> Frame {
    Frame {
        width: 8,
        height: 8,
        pixels: vec![128; 8 * 8 * 3],
    }
}

pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[derive(Default)]
pub struct CaptureStats {
    pub opened: AtomicUsize,
    pub released: AtomicUsize,
    pub reads: AtomicUsize,
}

/// Endless frames unless `frames_per_source` is set; sources listed in
/// `unreachable` fail to open.
#[derive(Default)]
pub struct FakeCapture {
    pub stats: Arc<CaptureStats>,
    pub unreachable: HashSet<String>,
    pub frames_per_source: Option<usize>,
    /// Every n-th read reports temporary unavailability.
    pub unavailable_every: Option<usize>,
    /// Sources read this many frames, then panic on the next read.
    pub panic_after_reads: Option<usize>,
    /// Sources that panic on their next open, once each.
    pub panic_on_open: Mutex<HashSet<String>>,
    pub open_delay: Option<Duration>,
}

impl FakeCapture {
    pub fn opened(&self) -> usize {
        self.stats.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.stats.released.load(Ordering::SeqCst)
    }
}

impl CaptureBackend for FakeCapture {
    fn open(&self, source: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        let panics = self.panic_on_open.lock().unwrap().remove(source);
        if panics {
            panic!("capture backend crashed opening {source}");
        }
        if self.unreachable.contains(source) {
            return Err(CaptureError::SourceUnavailable(source.to_string()));
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            stats: self.stats.clone(),
            remaining: self.frames_per_source,
            unavailable_every: self.unavailable_every,
            panic_after_reads: self.panic_after_reads,
            reads: 0,
        }))
    }
}

pub struct FakeSource {
    stats: Arc<CaptureStats>,
    remaining: Option<usize>,
    unavailable_every: Option<usize>,
    panic_after_reads: Option<usize>,
    reads: usize,
}

impl FrameSource for FakeSource {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.panic_after_reads == Some(self.reads) {
            panic!("decoder crashed after {} frames", self.reads);
        }
        self.reads += 1;
        self.stats.reads.fetch_add(1, Ordering::SeqCst);

        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(CaptureError::Exhausted);
            }
            *remaining -= 1;
        }

        if matches!(self.unavailable_every, Some(n) if self.reads % n == 0) {
            return Ok(None);
        }

        Ok(Some(frame()))
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reports the same detections for every frame, or fails when `detections`
/// is `None`.
pub struct FakeDetector {
    detections: Option<Vec<Detection>>,
    panics: bool,
    calls: AtomicUsize,
}

impl FakeDetector {
    pub fn reporting(label: &str, confidence: f32) -> Self {
        Self {
            detections: Some(vec![Detection {
                label: label.to_string(),
                confidence,
                bbox: [0.0, 0.0, 4.0, 4.0],
            }]),
            panics: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self {
            detections: Some(detections),
            panics: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            detections: None,
            panics: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn panicking() -> Self {
        Self {
            detections: None,
            panics: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for FakeDetector {
    fn infer(&self, _frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("inference backend crashed");
        }
        self.detections
            .clone()
            .ok_or_else(|| DetectError::Inference("model offline".into()))
    }
}

/// Fails the first `failures` submissions, then accepts.
pub struct ScriptedSink {
    failures: usize,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<IncidentPayload>>,
}

impl ScriptedSink {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures,
            attempts: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok() -> Self {
        Self::failing_first(0)
    }

    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<IncidentPayload> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl IncidentSink for ScriptedSink {
    async fn submit(&self, payload: &IncidentPayload) -> Result<(), DeliveryError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(DeliveryError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.delivered.lock().unwrap().push(payload.clone());
        Ok(())
    }
}
