use anyhow::{Context, Result};
use rollcall_core::{enroll, ModelBundle, Overlay, Readiness, Sampler, SamplerConfig, SharedLedger};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod camera_source;
mod config;
mod dbus_interface;
mod fetch;
mod gemini;

use camera_source::CameraSource;
use config::{BusKind, Config};
use dbus_interface::AttendanceService;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");
    let config = Config::from_env();

    let roster = config.load_roster().context("failed to load roster")?;
    tracing::info!(students = roster.len(), "roster ready");

    let models = ModelBundle::new();
    if let Readiness::Failed(reason) = models.load_onnx(config.model_dir.clone()).await {
        tracing::error!(dir = %config.model_dir.display(), %reason, "face models unavailable");
    }

    let fetcher = fetch::HttpFetcher::new().context("failed to build HTTP client")?;
    let enrollment = enroll(&roster, &fetcher, &models)
        .await
        .context("enrollment failed")?;
    let enrolled = enrollment.descriptors.len();
    let skipped = enrollment.skipped.clone();
    let matcher = enrollment
        .into_matcher(config.match_threshold)
        .context("invalid match configuration")?;

    let ledger = SharedLedger::new(&roster);
    let sampler = Sampler::new(
        SamplerConfig {
            interval: config.sample_interval,
            escalate_after: config.escalate_after,
        },
        models.clone(),
        matcher,
        roster.clone(),
        Box::new(CameraSource::new(config.camera_device.clone(), config.warmup_frames)),
        ledger.clone(),
    );

    let (handle, sampler_error) = match sampler.start().await {
        Ok(handle) => (Some(handle), None),
        Err(e) => {
            tracing::error!(error = %e, device = %config.camera_device, "sampling could not start");
            (None, Some(e.to_string()))
        }
    };

    if let (Some(handle), Some(path)) = (&handle, config.overlay_path.clone()) {
        tokio::spawn(write_overlays(handle.overlay(), path));
    }

    let sampler = Arc::new(Mutex::new(handle));
    let reporter = gemini::GeminiReporter::new(
        config.report_endpoint.clone(),
        config.report_model.clone(),
        config.api_key.clone(),
    )
    .context("failed to build report client")?;

    let service = AttendanceService {
        ledger,
        roster,
        models,
        sampler: Arc::clone(&sampler),
        sampler_error,
        enrolled,
        skipped,
        match_threshold: config.match_threshold,
        reporter: Arc::new(reporter),
    };

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    let handle = sampler
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take();
    if let Some(handle) = handle {
        handle.stop().await;
    }

    Ok(())
}

/// Save the annotated frame as a PNG after every tick.
async fn write_overlays(mut overlays: watch::Receiver<Overlay>, path: PathBuf) {
    while overlays.changed().await.is_ok() {
        let overlay = overlays.borrow_and_update().clone();
        let path = path.clone();
        let saved = tokio::task::spawn_blocking(move || match overlay.render() {
            Some(img) => img.save(&path).map(|_| true),
            None => Ok(false),
        })
        .await;
        match saved {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to save overlay image"),
            Err(e) => tracing::warn!(error = %e, "overlay writer task failed"),
        }
    }
}
