use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::RotationConfig;

use super::supervisor::Supervisor;

const ERROR_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct RotationSettings {
    pub interval: Duration,
    pub cameras_per_rotation: usize,
    pub error_backoff: Duration,
}

impl From<&RotationConfig> for RotationSettings {
    fn from(config: &RotationConfig) -> Self {
        Self {
            interval: config.interval(),
            cameras_per_rotation: config.cameras_per_rotation.max(1),
            error_backoff: ERROR_BACKOFF,
        }
    }
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self::from(&RotationConfig::default())
    }
}

#[derive(Debug, Default)]
struct RotationState {
    /// Generation of the rotation run that owns the state, zero when idle.
    generation: u64,
    cameras: Vec<String>,
    cursor: usize,
    selection: Vec<String>,
}

impl RotationState {
    /// Picks the next `size` cameras from the cursor, wrapping around. Never
    /// picks the same camera twice in one selection.
    fn advance(&mut self, size: usize) -> Vec<String> {
        let len = self.cameras.len();
        if len == 0 {
            return Vec::new();
        }

        let take = size.min(len);
        let picked = (0..take)
            .map(|i| self.cameras[(self.cursor + i) % len].clone())
            .collect();
        self.cursor = (self.cursor + take) % len;
        picked
    }
}

struct RotationTask {
    cancel: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

/// Cycles detection through the active cameras a few at a time.
///
/// The camera list is taken from the registry when rotation starts. Each
/// tick stops the cameras the previous tick started and starts the next
/// selection. Ticks and `stop_rotation` are serialised on the rotation
/// state, so a stop never races a tick into starting cameras afterwards.
/// Cameras that were already running when picked are left to whoever
/// started them. Only cameras a tick actually started are recorded, so
/// `current_cameras` omits picks whose start failed and can be shorter than
/// `cameras_per_rotation`. A tick that panics is retried after
/// `error_backoff`.
pub struct RotationScheduler {
    supervisor: Arc<Supervisor>,
    settings: RotationSettings,
    state: Mutex<RotationState>,
    current: RwLock<Vec<String>>,
    control: Mutex<Option<RotationTask>>,
    generation: AtomicU64,
}

impl RotationScheduler {
    pub fn new(supervisor: Arc<Supervisor>, settings: RotationSettings) -> Self {
        Self {
            supervisor,
            settings,
            state: Mutex::new(RotationState::default()),
            current: RwLock::new(Vec::new()),
            control: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn start_rotation(self: &Arc<Self>) -> bool {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if control.is_some() {
            tracing::warn!("auto rotation already running");
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let cameras = self.supervisor.registry().active_ids();
        {
            let mut state = self.lock_state();
            *state = RotationState {
                generation,
                cameras: cameras.clone(),
                cursor: 0,
                selection: Vec::new(),
            };
        }

        let (cancel, cancelled) = watch::channel(false);
        let this = Arc::clone(self);
        let task = self
            .supervisor
            .context()
            .runtime
            .spawn(async move { this.run(generation, cancelled).await });

        *control = Some(RotationTask {
            cancel,
            _task: task,
        });

        tracing::info!(
            cameras = cameras.len(),
            per_rotation = self.settings.cameras_per_rotation,
            interval_secs = self.settings.interval.as_secs(),
            "auto rotation started"
        );
        true
    }

    /// Stops the rotation loop and every camera it started. Idempotent.
    pub fn stop_rotation(&self) -> bool {
        let task = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = &task {
            let _ = task.cancel.send(true);
        }

        let selection = {
            let mut state = self.lock_state();
            state.generation = 0;
            self.publish(Vec::new());
            std::mem::take(&mut state.selection)
        };

        for camera_id in &selection {
            self.supervisor.stop(camera_id);
        }

        if task.is_some() {
            tracing::info!(stopped = selection.len(), "auto rotation stopped");
        }
        true
    }

    pub fn is_active(&self) -> bool {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn current_cameras(&self) -> Vec<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, selection: Vec<String>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = selection;
    }

    async fn run(self: Arc<Self>, generation: u64, mut cancelled: watch::Receiver<bool>) {
        loop {
            let this = Arc::clone(&self);
            let tick = tokio::task::spawn_blocking(move || this.rotate_once(generation)).await;

            let wait = match tick {
                Ok(Some(_)) => self.settings.interval,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "auto rotation tick panicked");
                    self.settings.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancelled.changed() => break,
            }
        }

        tracing::debug!(generation, "auto rotation loop exited");
    }

    /// Runs one rotation tick. `None` when the run identified by
    /// `generation` has been stopped.
    fn rotate_once(&self, generation: u64) -> Option<Vec<String>> {
        let mut state = self.lock_state();
        if state.generation == 0 || state.generation != generation {
            return None;
        }

        for camera_id in std::mem::take(&mut state.selection) {
            self.supervisor.stop(&camera_id);
        }

        let picked = state.advance(self.settings.cameras_per_rotation);
        let mut selection = Vec::with_capacity(picked.len());
        for camera_id in picked {
            match self.supervisor.start(&camera_id) {
                Ok(()) => selection.push(camera_id),
                Err(e) => {
                    tracing::warn!(camera = %camera_id, error = %e, "rotation could not start camera")
                }
            }
        }

        tracing::info!(cameras = ?selection, "rotated to cameras");
        state.selection = selection.clone();
        self.publish(selection.clone());
        Some(selection)
    }

    #[cfg(test)]
    fn rotate_now(&self) -> Option<Vec<String>> {
        let generation = self.lock_state().generation;
        self.rotate_once(generation)
    }

    fn lock_state(&self) -> MutexGuard<'_, RotationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, registry, wait_until, FakeCapture, FakeDetector, ScriptedSink};

    fn scheduler(ids: &[&str], per_rotation: usize) -> (Arc<RotationScheduler>, Arc<Supervisor>) {
        scheduler_with(FakeCapture::default(), ids, per_rotation)
    }

    fn scheduler_with(
        capture: FakeCapture,
        ids: &[&str],
        per_rotation: usize,
    ) -> (Arc<RotationScheduler>, Arc<Supervisor>) {
        let ctx = context(
            Arc::new(FakeDetector::reporting("dog", 0.9)),
            Arc::new(ScriptedSink::always_ok()),
            3,
        );
        let supervisor = Arc::new(Supervisor::new(
            registry(ids),
            Arc::new(capture),
            ctx,
        ));
        let settings = RotationSettings {
            interval: Duration::from_secs(3600),
            cameras_per_rotation: per_rotation,
            error_backoff: Duration::from_millis(10),
        };
        (
            Arc::new(RotationScheduler::new(supervisor.clone(), settings)),
            supervisor,
        )
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_advance_wraps_without_duplicates() {
        let mut state = RotationState {
            cameras: ids(&["A", "B", "C"]),
            ..Default::default()
        };

        assert_eq!(state.advance(2), ids(&["A", "B"]));
        assert_eq!(state.advance(2), ids(&["C", "A"]));
        assert_eq!(state.advance(5), ids(&["B", "C", "A"]));
        assert!(RotationState::default().advance(2).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rotation_sequence() {
        let (rotation, supervisor) = scheduler(&["A", "B", "C", "D", "E"], 2);

        assert!(rotation.start_rotation());
        assert!(wait_until(Duration::from_secs(2), || rotation.current_cameras() == ids(&["A", "B"])).await);
        assert_eq!(supervisor.running_ids(), ids(&["A", "B"]));

        assert_eq!(rotation.rotate_now(), Some(ids(&["C", "D"])));
        assert_eq!(supervisor.running_ids(), ids(&["C", "D"]));

        assert_eq!(rotation.rotate_now(), Some(ids(&["E", "A"])));
        assert_eq!(supervisor.running_ids(), ids(&["A", "E"]));

        assert!(rotation.stop_rotation());
        assert!(supervisor.running_ids().is_empty());
        assert!(rotation.current_cameras().is_empty());
        supervisor.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_small_camera_list_has_no_duplicates() {
        let (rotation, supervisor) = scheduler(&["A"], 2);

        assert!(rotation.start_rotation());
        assert!(wait_until(Duration::from_secs(2), || !rotation.current_cameras().is_empty()).await);
        assert_eq!(rotation.current_cameras(), ids(&["A"]));
        assert_eq!(rotation.rotate_now(), Some(ids(&["A"])));
        assert_eq!(supervisor.running_ids(), ids(&["A"]));

        rotation.stop_rotation();
        supervisor.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_twice_and_idempotent_stop() {
        let (rotation, supervisor) = scheduler(&["A", "B"], 2);

        assert!(rotation.stop_rotation());
        assert!(rotation.start_rotation());
        assert!(!rotation.start_rotation());
        assert!(rotation.is_active());

        assert!(rotation.stop_rotation());
        assert!(rotation.stop_rotation());
        assert!(!rotation.is_active());

        // A stopped run never rotates again
        assert_eq!(rotation.rotate_now(), None);
        assert!(supervisor.running_ids().is_empty());

        supervisor.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rotation_leaves_manual_cameras_alone() {
        let (rotation, supervisor) = scheduler(&["A", "B", "C"], 1);

        assert!(supervisor.start("C").is_ok());
        assert!(rotation.start_rotation());
        assert!(wait_until(Duration::from_secs(2), || rotation.current_cameras() == ids(&["A"])).await);

        assert_eq!(rotation.rotate_now(), Some(ids(&["B"])));
        // C is already running, so this tick starts nothing of its own
        assert_eq!(rotation.rotate_now(), Some(Vec::new()));
        assert_eq!(supervisor.running_ids(), ids(&["C"]));

        assert_eq!(rotation.rotate_now(), Some(ids(&["A"])));
        rotation.stop_rotation();
        assert_eq!(supervisor.running_ids(), ids(&["C"]));

        supervisor.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_starts_are_left_out_of_selection() {
        let capture = FakeCapture {
            unreachable: ["fake://A".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let (rotation, supervisor) = scheduler_with(capture, &["A", "B", "C"], 2);

        assert!(rotation.start_rotation());
        assert!(wait_until(Duration::from_secs(2), || rotation.current_cameras() == ids(&["B"])).await);
        assert_eq!(supervisor.running_ids(), ids(&["B"]));

        rotation.stop_rotation();
        supervisor.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_tick_backs_off_and_recovers() {
        let capture = FakeCapture {
            panic_on_open: Mutex::new(["fake://A".to_string()].into_iter().collect()),
            ..Default::default()
        };
        let (rotation, supervisor) = scheduler_with(capture, &["A", "B"], 1);

        // The first tick panics while holding the rotation state
        assert!(rotation.start_rotation());
        assert!(wait_until(Duration::from_secs(2), || rotation.current_cameras() == ids(&["B"])).await);
        assert!(rotation.is_active());
        assert!(!supervisor.is_running("A"));

        assert_eq!(rotation.rotate_now(), Some(ids(&["A"])));
        assert_eq!(supervisor.running_ids(), ids(&["A"]));

        rotation.stop_rotation();
        assert!(supervisor.running_ids().is_empty());
        supervisor.shutdown(Duration::from_secs(2)).await;
    }
}
