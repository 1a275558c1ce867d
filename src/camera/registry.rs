use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::CameraConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct Camera {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub source: String,
    pub location: Location,
    pub priority: Priority,
    pub active: bool,
}

impl From<CameraConfig> for Camera {
    fn from(config: CameraConfig) -> Self {
        let name = if config.name.is_empty() {
            config.id.clone()
        } else {
            config.name
        };
        Self {
            id: config.id,
            name,
            source: config.url,
            location: config.location,
            priority: config.priority,
            active: config.active,
        }
    }
}

/// Camera catalog in configuration order. Only the `active` flag changes
/// after load.
pub struct CameraRegistry {
    cameras: RwLock<Vec<Camera>>,
}

impl CameraRegistry {
    pub fn new(cameras: Vec<Camera>) -> Self {
        Self {
            cameras: RwLock::new(cameras),
        }
    }

    pub fn from_config(cameras: Vec<CameraConfig>) -> Self {
        Self::new(cameras.into_iter().map(Camera::from).collect())
    }

    pub fn all(&self) -> Vec<Camera> {
        self.cameras
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, camera_id: &str) -> Option<Camera> {
        self.cameras
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.id == camera_id)
            .cloned()
    }

    pub fn is_active(&self, camera_id: &str) -> bool {
        self.get(camera_id).map(|c| c.active).unwrap_or(false)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.cameras
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.active)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn by_priority(&self, priority: Priority) -> Vec<String> {
        self.cameras
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.active && c.priority == priority)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Returns false for an unknown camera.
    pub fn set_active(&self, camera_id: &str, active: bool) -> bool {
        let mut cameras = self
            .cameras
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match cameras.iter_mut().find(|c| c.id == camera_id) {
            Some(camera) => {
                camera.active = active;
                true
            }
            None => false,
        }
    }
}
