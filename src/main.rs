use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

mod analytics;
mod api;
mod camera;
mod config;
mod delivery;
mod detection;
#[cfg(test)]
mod testing;

use analytics::OnnxDetector;
use api::AppState;
use camera::{CameraRegistry, OpenCvCapture};
use config::Config;
use delivery::{HttpIncidentSink, RetryPolicy, Uploader};
use detection::{DetectionService, ServiceSettings};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("streetwatch=debug".parse()?))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::info!("loaded {} camera(s)", config.cameras.len());

    // No model, no service
    let detector = match OnnxDetector::new(&config.model) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            tracing::error!(error = %e, "failed to load detection model");
            return Err(e.into());
        }
    };

    let registry = Arc::new(CameraRegistry::from_config(config.cameras.clone()));
    let sink = HttpIncidentSink::new(&config.incident_api)?;
    tracing::info!(url = %sink.url(), "incident api configured");

    let uploader = Arc::new(Uploader::new(
        Arc::new(sink),
        RetryPolicy {
            attempts: config.incident_api.retry_attempts,
            delay: config.incident_api.retry_delay(),
        },
    ));

    let service = Arc::new(DetectionService::new(
        registry,
        Arc::new(OpenCvCapture),
        detector,
        uploader,
        ServiceSettings::from_config(&config),
        tokio::runtime::Handle::current(),
    ));

    if config.rotation.autostart {
        let svc = Arc::clone(&service);
        tokio::task::spawn_blocking(move || svc.start_rotation()).await?;
    }

    let server = api::start_server(AppState::new(Arc::clone(&service)), &config.http, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown signal received");
    });

    if let Err(e) = server.await {
        tracing::error!(error = %e, "HTTP server failed");
    }

    service.shutdown(SHUTDOWN_GRACE).await;
    tracing::info!("shutdown complete");

    Ok(())
}
