use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::analytics::IncidentType;
use crate::camera::Priority;
use crate::config::HttpConfig;
use crate::detection::{CameraView, DetectionService, DetectionStatus, StartError};

const TEST_CAMERA_ID: &str = "CCTV-DEV-001";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DetectionService>,
    pub started: Instant,
}

impl AppState {
    pub fn new(service: Arc<DetectionService>) -> Self {
        Self {
            service,
            started: Instant::now(),
        }
    }
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

fn success<T: Serialize>(message: Option<String>, data: Option<T>) -> Response {
    Json(Envelope {
        status: "success",
        message,
        data,
    })
    .into_response()
}

fn failure(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(Envelope::<()> {
            status: "error",
            message: Some(message.into()),
            data: None,
        }),
    )
        .into_response()
}

#[derive(Serialize)]
struct BannerResponse {
    service: &'static str,
    version: &'static str,
    endpoints: Vec<&'static str>,
}

#[derive(Serialize)]
struct HealthResponse {
    state: &'static str,
    timestamp: String,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct StatusResponse {
    system_status: DetectionStatus,
    available_cameras: Vec<String>,
    active_cameras: Vec<String>,
    timestamp: String,
}

#[derive(Serialize)]
struct CamerasResponse {
    total: usize,
    active: usize,
    cameras: Vec<CameraView>,
}

#[derive(Deserialize)]
struct CamerasQuery {
    priority: Option<Priority>,
}

#[derive(Deserialize)]
struct CameraStatusRequest {
    active: bool,
}

#[derive(Deserialize, Default)]
struct TestDetectionRequest {
    cctv_id: Option<String>,
    incident_type: Option<IncidentType>,
}

#[derive(Serialize)]
struct TestDetectionResponse {
    cctv_id: String,
    incident_type: IncidentType,
    delivered: bool,
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/cameras", get(cameras_handler))
        .route("/cameras/{id}/status", put(camera_status_handler))
        .route("/start/{id}", post(start_handler))
        .route("/stop/{id}", post(stop_handler))
        .route("/start-auto-rotation", post(start_rotation_handler))
        .route("/stop-auto-rotation", post(stop_rotation_handler))
        .route("/detection-stats", get(stats_handler))
        .route("/test-detection", post(test_detection_handler))
        .fallback(not_found_handler)
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    layer.allow_origin(AllowOrigin::list(origins))
}

pub async fn start_server<F>(
    state: AppState,
    config: &HttpConfig,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = router(state, &config.cors_origins);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!("starting HTTP server on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn index_handler() -> Response {
    success(
        Some("CCTV incident detection service".to_string()),
        Some(BannerResponse {
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            endpoints: vec![
                "GET /health",
                "GET /status",
                "GET /cameras",
                "PUT /cameras/{id}/status",
                "POST /start/{id}",
                "POST /stop/{id}",
                "POST /start-auto-rotation",
                "POST /stop-auto-rotation",
                "GET /detection-stats",
                "POST /test-detection",
            ],
        }),
    )
}

async fn health_handler(State(state): State<AppState>) -> Response {
    success(
        None,
        Some(HealthResponse {
            state: "healthy",
            timestamp: Utc::now().to_rfc3339(),
            uptime_secs: state.started.elapsed().as_secs(),
        }),
    )
}

async fn status_handler(State(state): State<AppState>) -> Response {
    let cameras = state.service.registry().all();

    success(
        None,
        Some(StatusResponse {
            system_status: state.service.status(),
            available_cameras: cameras.iter().map(|c| c.id.clone()).collect(),
            active_cameras: cameras
                .iter()
                .filter(|c| c.active)
                .map(|c| c.id.clone())
                .collect(),
            timestamp: Utc::now().to_rfc3339(),
        }),
    )
}

async fn cameras_handler(
    State(state): State<AppState>,
    Query(query): Query<CamerasQuery>,
) -> Response {
    let mut cameras = state.service.cameras();
    if let Some(priority) = query.priority {
        let ids = state.service.registry().by_priority(priority);
        cameras.retain(|c| ids.contains(&c.camera.id));
    }

    success(
        None,
        Some(CamerasResponse {
            total: cameras.len(),
            active: cameras.iter().filter(|c| c.camera.active).count(),
            cameras,
        }),
    )
}

async fn camera_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CameraStatusRequest>,
) -> Response {
    let active = request.active;
    let service = state.service.clone();
    let camera_id = id.clone();
    let changed =
        tokio::task::spawn_blocking(move || service.set_camera_active(&camera_id, active)).await;

    match changed {
        Ok(true) => success::<()>(
            Some(format!(
                "Camera {id} is now {}",
                if active { "active" } else { "inactive" }
            )),
            None,
        ),
        Ok(false) => failure(StatusCode::NOT_FOUND, format!("Camera {id} not found")),
        Err(e) => {
            tracing::error!(camera = %id, error = %e, "camera status task failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

async fn start_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let service = state.service.clone();
    let camera_id = id.clone();
    match tokio::task::spawn_blocking(move || service.try_start(&camera_id)).await {
        Ok(Ok(())) => success::<()>(Some(format!("Detection started for camera {id}")), None),
        Ok(Err(StartError::UnknownCamera(_) | StartError::Inactive(_))) => failure(
            StatusCode::BAD_REQUEST,
            format!("Camera {id} is not active or does not exist"),
        ),
        Ok(Err(StartError::AlreadyRunning(_))) => failure(
            StatusCode::CONFLICT,
            format!("Detection already running for camera {id}"),
        ),
        Ok(Err(e)) => {
            tracing::warn!(camera = %id, error = %e, "start request failed");
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to start detection for camera {id}"),
            )
        }
        Err(e) => {
            tracing::error!(camera = %id, error = %e, "start task failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

async fn stop_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    state.service.stop(&id);
    success::<()>(Some(format!("Detection stopped for camera {id}")), None)
}

async fn start_rotation_handler(State(state): State<AppState>) -> Response {
    let service = state.service.clone();
    match tokio::task::spawn_blocking(move || service.start_rotation()).await {
        Ok(true) => success::<()>(Some("Auto rotation started".to_string()), None),
        Ok(false) => failure(StatusCode::BAD_REQUEST, "Auto rotation is already running"),
        Err(e) => {
            tracing::error!(error = %e, "start rotation task failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

async fn stop_rotation_handler(State(state): State<AppState>) -> Response {
    let service = state.service.clone();
    match tokio::task::spawn_blocking(move || service.stop_rotation()).await {
        Ok(_) => success::<()>(Some("Auto rotation stopped".to_string()), None),
        Err(e) => {
            tracing::error!(error = %e, "stop rotation task failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

async fn stats_handler(State(state): State<AppState>) -> Response {
    success(None, Some(state.service.stats()))
}

async fn test_detection_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request: TestDetectionRequest = if body.is_empty() {
        TestDetectionRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => return failure(StatusCode::BAD_REQUEST, format!("Invalid request: {e}")),
        }
    };

    let cctv_id = request
        .cctv_id
        .unwrap_or_else(|| TEST_CAMERA_ID.to_string());
    let incident_type = request.incident_type.unwrap_or(IncidentType::Accident);

    let delivered = state
        .service
        .send_test_incident(&cctv_id, incident_type)
        .await;

    let message = format!("Test detection sent: {incident_type} from {cctv_id}");
    let data = TestDetectionResponse {
        cctv_id,
        incident_type,
        delivered,
    };

    if delivered {
        success(Some(message), Some(data))
    } else {
        (
            StatusCode::BAD_GATEWAY,
            Json(Envelope {
                status: "error",
                message: Some(message),
                data: Some(data),
            }),
        )
            .into_response()
    }
}

async fn not_found_handler() -> Response {
    failure(StatusCode::NOT_FOUND, "Endpoint not found")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::delivery::{RetryPolicy, Uploader};
    use crate::detection::{RotationSettings, ServiceSettings, SnapshotSettings};
    use crate::testing::{fast_timing, registry, FakeCapture, FakeDetector, ScriptedSink};

    async fn serve(sink: Arc<ScriptedSink>) -> (String, Arc<DetectionService>) {
        serve_with(sink, FakeCapture::default()).await
    }

    async fn serve_with(
        sink: Arc<ScriptedSink>,
        capture: FakeCapture,
    ) -> (String, Arc<DetectionService>) {
        let uploader = Arc::new(Uploader::new(
            sink,
            RetryPolicy {
                attempts: 1,
                delay: Duration::from_millis(1),
            },
        ));
        let settings = ServiceSettings {
            timing: fast_timing(),
            snapshots: SnapshotSettings::default(),
            max_per_minute: 3,
            rotation: RotationSettings {
                interval: Duration::from_secs(3600),
                cameras_per_rotation: 2,
                error_backoff: Duration::from_millis(10),
            },
        };
        let service = Arc::new(DetectionService::new(
            registry(&["A", "B"]),
            Arc::new(capture),
            Arc::new(FakeDetector::reporting("dog", 0.9)),
            uploader,
            settings,
            tokio::runtime::Handle::current(),
        ));

        let app = router(AppState::new(service.clone()), &[]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), service)
    }

    async fn call(method: reqwest::Method, url: String) -> (u16, serde_json::Value) {
        let response = reqwest::Client::new()
            .request(method, url)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_stop_over_http() {
        let (base, service) = serve(Arc::new(ScriptedSink::always_ok())).await;

        let (code, body) = call(reqwest::Method::POST, format!("{base}/start/A")).await;
        assert_eq!(code, 200);
        assert_eq!(body["status"], "success");

        let (code, _) = call(reqwest::Method::POST, format!("{base}/start/A")).await;
        assert_eq!(code, 409);

        let (code, body) = call(reqwest::Method::POST, format!("{base}/start/nope")).await;
        assert_eq!(code, 400);
        assert_eq!(body["status"], "error");

        let (_, body) = call(reqwest::Method::GET, format!("{base}/status")).await;
        assert_eq!(body["data"]["system_status"]["running_camera_ids"][0], "A");
        assert_eq!(body["data"]["available_cameras"].as_array().unwrap().len(), 2);

        let (code, _) = call(reqwest::Method::POST, format!("{base}/stop/A")).await;
        assert_eq!(code, 200);
        let (_, body) = call(reqwest::Method::GET, format!("{base}/detection-stats")).await;
        assert_eq!(body["data"]["active_detections"], 0);

        service.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_starts_get_conflict() {
        let capture = FakeCapture {
            open_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let (base, service) = serve_with(Arc::new(ScriptedSink::always_ok()), capture).await;

        let (first, second) = tokio::join!(
            call(reqwest::Method::POST, format!("{base}/start/A")),
            call(reqwest::Method::POST, format!("{base}/start/A")),
        );
        let mut codes = vec![first.0, second.0];
        codes.sort();
        assert_eq!(codes, vec![200, 409]);

        let (_, body) = call(reqwest::Method::GET, format!("{base}/status")).await;
        assert_eq!(body["data"]["system_status"]["running_camera_ids"][0], "A");

        service.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rotation_endpoints() {
        let (base, service) = serve(Arc::new(ScriptedSink::always_ok())).await;

        let (code, _) = call(reqwest::Method::POST, format!("{base}/start-auto-rotation")).await;
        assert_eq!(code, 200);
        let (code, body) = call(reqwest::Method::POST, format!("{base}/start-auto-rotation")).await;
        assert_eq!(code, 400);
        assert_eq!(body["message"], "Auto rotation is already running");

        let (code, _) = call(reqwest::Method::POST, format!("{base}/stop-auto-rotation")).await;
        assert_eq!(code, 200);
        let (code, _) = call(reqwest::Method::POST, format!("{base}/stop-auto-rotation")).await;
        assert_eq!(code, 200);

        service.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_test_detection_and_fallback() {
        let sink = Arc::new(ScriptedSink::always_ok());
        let (base, _service) = serve(sink.clone()).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/test-detection"))
            .json(&serde_json::json!({"cctv_id": "CCTV-009", "incident_type": "fire"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["data"]["delivered"], true);
        assert_eq!(sink.delivered()[0].cctv_id, "CCTV-009");

        let (code, body) = call(reqwest::Method::GET, format!("{base}/nowhere")).await;
        assert_eq!(code, 404);
        assert_eq!(body["message"], "Endpoint not found");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_camera_toggle() {
        let (base, service) = serve(Arc::new(ScriptedSink::always_ok())).await;
        let client = reqwest::Client::new();

        let response = client
            .put(format!("{base}/cameras/B/status"))
            .json(&serde_json::json!({"active": false}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let (_, body) = call(reqwest::Method::GET, format!("{base}/cameras")).await;
        assert_eq!(body["data"]["total"], 2);
        assert_eq!(body["data"]["active"], 1);
        assert!(body["data"]["cameras"][0].get("source").is_none());

        let (_, body) = call(reqwest::Method::GET, format!("{base}/cameras?priority=high")).await;
        assert_eq!(body["data"]["total"], 1);
        assert_eq!(body["data"]["cameras"][0]["id"], "A");

        let response = client
            .put(format!("{base}/cameras/ZZ/status"))
            .json(&serde_json::json!({"active": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);

        service.shutdown(Duration::from_secs(2)).await;
    }
}
