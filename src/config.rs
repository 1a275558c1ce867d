use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::camera::{Location, Priority};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no cameras configured")]
    NoCameras,
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_model_path() -> String {
    "yolov8n.onnx".to_string()
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_output_name() -> String {
    "output0".to_string()
}

fn default_intra_threads() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_path")]
    pub path: String,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_output_name")]
    pub output_name: String,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    /// Class names of a custom model; empty means the COCO table.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            confidence_threshold: default_confidence_threshold(),
            output_name: default_output_name(),
            intra_threads: default_intra_threads(),
            labels: Vec::new(),
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_per_minute() -> u32 {
    3
}

fn default_snapshot_quality() -> i32 {
    90
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,
    #[serde(default = "default_snapshot_quality")]
    pub snapshot_quality: i32,
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
}

impl DetectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_per_minute: default_max_per_minute(),
            snapshot_quality: default_snapshot_quality(),
            snapshot_dir: None,
        }
    }
}

fn default_rotation_interval() -> u64 {
    300
}

fn default_cameras_per_rotation() -> usize {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_rotation_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_cameras_per_rotation")]
    pub cameras_per_rotation: usize,
    #[serde(default)]
    pub autostart: bool,
}

impl RotationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_rotation_interval(),
            cameras_per_rotation: default_cameras_per_rotation(),
            autostart: false,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_endpoint() -> String {
    "/incidents".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncidentApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl IncidentApiConfig {
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.endpoint.trim_start_matches('/')
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for IncidentApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    5000
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:8000".to_string(),
        "http://127.0.0.1:3000".to_string(),
        "http://127.0.0.1:8000".to_string(),
    ]
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub incident_api: IncidentApiConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate camera id '{}'",
                    camera.id
                )));
            }
        }

        if self.rotation.cameras_per_rotation == 0 {
            return Err(ConfigError::Invalid(
                "rotation.cameras_per_rotation must be at least 1".into(),
            ));
        }

        if self.incident_api.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "incident_api.retry_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
