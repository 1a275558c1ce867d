use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::camera::{redact, CameraRegistry, CaptureBackend, CaptureError};

use super::worker::{DetectionWorker, WorkerContext, WorkerExit};

struct WorkerSlot {
    generation: u64,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl WorkerSlot {
    fn is_launched(&self) -> bool {
        self.task.is_some()
    }
}

type WorkerMap = Arc<Mutex<HashMap<String, WorkerSlot>>>;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("unknown camera: {0}")]
    UnknownCamera(String),
    #[error("camera is inactive: {0}")]
    Inactive(String),
    #[error("detection already running for {0}")]
    AlreadyRunning(String),
    #[error("failed to open camera: {0}")]
    Open(#[from] CaptureError),
    #[error("detection for {0} was stopped while its camera was opening")]
    StoppedWhileOpening(String),
}

/// Owns the map of running detection workers, at most one per camera.
///
/// A slot is reserved before the capture source is opened so concurrent
/// `start` calls for the same camera cannot both succeed. Stopping removes
/// the slot immediately and lets the worker wind down on its own; the
/// stopped task is kept so `shutdown` can wait for its capture handle to be
/// released.
pub struct Supervisor {
    registry: Arc<CameraRegistry>,
    capture: Arc<dyn CaptureBackend>,
    context: Arc<WorkerContext>,
    workers: WorkerMap,
    retiring: Mutex<Vec<JoinHandle<()>>>,
    generation: AtomicU64,
}

impl Supervisor {
    pub fn new(
        registry: Arc<CameraRegistry>,
        capture: Arc<dyn CaptureBackend>,
        context: Arc<WorkerContext>,
    ) -> Self {
        Self {
            registry,
            capture,
            context,
            workers: Arc::new(Mutex::new(HashMap::new())),
            retiring: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<CameraRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.context
    }

    /// Starts a worker for the camera. Blocks while the capture source is
    /// opened, so async callers should go through the blocking pool.
    pub fn start(&self, camera_id: &str) -> Result<(), StartError> {
        let Some(camera) = self.registry.get(camera_id) else {
            tracing::warn!(camera = %camera_id, "cannot start detection: unknown camera");
            return Err(StartError::UnknownCamera(camera_id.to_string()));
        };

        if !camera.active {
            tracing::warn!(camera = %camera_id, "cannot start detection: camera inactive");
            return Err(StartError::Inactive(camera_id.to_string()));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let running = Arc::new(AtomicBool::new(true));

        {
            let mut workers = self.lock_workers();
            if workers.contains_key(camera_id) {
                tracing::debug!(camera = %camera_id, "detection already running");
                return Err(StartError::AlreadyRunning(camera_id.to_string()));
            }
            workers.insert(
                camera_id.to_string(),
                WorkerSlot {
                    generation,
                    running: running.clone(),
                    task: None,
                },
            );
        }

        let slot = SlotGuard {
            workers: self.workers.clone(),
            camera_id: camera_id.to_string(),
            generation,
        };

        tracing::info!(camera = %camera_id, source = %redact(&camera.source), "opening camera");

        let source = match self.capture.open(&camera.source) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(camera = %camera_id, error = %e, "failed to open camera");
                return Err(e.into());
            }
        };

        if !running.load(Ordering::Acquire) {
            tracing::info!(camera = %camera_id, "detection stopped while opening camera");
            drop(source);
            return Err(StartError::StoppedWhileOpening(camera_id.to_string()));
        }

        let worker = DetectionWorker::new(
            camera_id.to_string(),
            source,
            self.context.clone(),
            running,
        );

        let task = self.context.runtime.spawn_blocking(move || {
            // Held for the whole run
            let slot = slot;
            if worker.run() == WorkerExit::Exhausted {
                tracing::info!(camera = %slot.camera_id, "camera stream ended, detection idle");
            }
        });

        let mut workers = self.lock_workers();
        match workers.get_mut(camera_id) {
            Some(slot) if slot.generation == generation => slot.task = Some(task),
            _ => {
                drop(workers);
                self.retire(task);
            }
        }

        tracing::info!(camera = %camera_id, "detection started");
        Ok(())
    }

    /// Flags the camera's worker to stop. Returns before the worker has
    /// released its capture handle.
    pub fn stop(&self, camera_id: &str) -> bool {
        let slot = self.lock_workers().remove(camera_id);

        match slot {
            Some(slot) => {
                slot.running.store(false, Ordering::Release);
                if let Some(task) = slot.task {
                    self.retire(task);
                }
                tracing::info!(camera = %camera_id, "detection stop requested");
            }
            None => {
                tracing::debug!(camera = %camera_id, "detection not running, nothing to stop");
            }
        }

        true
    }

    /// Only cameras whose worker has been launched count as running; a
    /// camera whose source is still opening does not.
    pub fn is_running(&self, camera_id: &str) -> bool {
        self.lock_workers()
            .get(camera_id)
            .is_some_and(WorkerSlot::is_launched)
    }

    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock_workers()
            .iter()
            .filter(|(_, slot)| slot.is_launched())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn running_count(&self) -> usize {
        self.lock_workers()
            .values()
            .filter(|slot| slot.is_launched())
            .count()
    }

    /// Stops every worker and waits up to `grace` for their capture handles
    /// to be released.
    pub async fn shutdown(&self, grace: Duration) {
        let slots: Vec<(String, WorkerSlot)> = self.lock_workers().drain().collect();

        for (camera_id, slot) in slots {
            slot.running.store(false, Ordering::Release);
            if let Some(task) = slot.task {
                self.retire(task);
            }
            tracing::debug!(camera = %camera_id, "detection stop requested");
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.retiring.lock().unwrap_or_else(PoisonError::into_inner),
        );

        let deadline = tokio::time::Instant::now() + grace;
        let mut pending = 0usize;
        for task in tasks {
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "detection worker panicked"),
                Err(_) => pending += 1,
            }
        }

        if pending > 0 {
            tracing::warn!(pending, "detection workers still running after grace period");
        } else {
            tracing::info!("all detection workers stopped");
        }
    }

    fn retire(&self, task: JoinHandle<()>) {
        let mut retiring = self.retiring.lock().unwrap_or_else(PoisonError::into_inner);
        retiring.retain(|t| !t.is_finished());
        retiring.push(task);
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<String, WorkerSlot>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a reserved slot when dropped. Moved into the worker task once the
/// source is open, so the slot is freed on every exit path, unwinding included.
struct SlotGuard {
    workers: WorkerMap,
    camera_id: String,
    generation: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        release_slot(&self.workers, &self.camera_id, self.generation);
    }
}

/// Drops the camera's slot unless it has since been replaced by a newer start.
fn release_slot(workers: &WorkerMap, camera_id: &str, generation: u64) {
    let mut workers = workers.lock().unwrap_or_else(PoisonError::into_inner);
    if workers
        .get(camera_id)
        .is_some_and(|slot| slot.generation == generation)
    {
        workers.remove(camera_id);
    }
}
